use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use log::trace;
use serde::{Deserialize, Serialize};

use crate::model::{RuntimeError, RuntimeResult};

const DEFAULT_ALLOCATOR_PATH: &str = "/root/ddocker-network/ipam/subnet.json";

/// Persisted allocation state: one bitmap string per subnet, `'0'`/`'1'`
/// per byte standing for a host address in that subnet, bit 0 standing
/// for the subnet's first usable address (`.1`, the gateway).
#[derive(Debug, Default, Serialize, Deserialize)]
struct Subnets(HashMap<String, String>);

/// A bitmap-per-CIDR IP allocator backed by a JSON file, mirroring the
/// upstream `ipam.go` bit-math: index-to-address by spreading the index
/// across the subnet's byte range and adding 1 (bit 0 is `.1`, not the
/// network address itself), address-to-index by the reverse
/// subtraction. The bitmap runs the full host count (`2^(32-prefix)`)
/// with no slots pre-reserved for network/broadcast - the upstream
/// allocator doesn't reserve them either, so the bitmap's last slot maps
/// one address past the subnet's broadcast address. This is a known
/// quirk of the allocator being replicated, not a new one.
pub struct IpAddressManager {
    allocator_path: PathBuf,
}

impl IpAddressManager {
    pub fn new() -> IpAddressManager {
        IpAddressManager { allocator_path: PathBuf::from(DEFAULT_ALLOCATOR_PATH) }
    }

    #[cfg(test)]
    fn at(path: PathBuf) -> IpAddressManager {
        IpAddressManager { allocator_path: path }
    }

    /// Allocates the first free address in `subnet`, creating the subnet's
    /// all-zero bitmap on first use. Returns the allocated address.
    pub fn allocate(&self, subnet: &Ipv4Net) -> RuntimeResult<Ipv4Addr> {
        let mut subnets = self.load()?;
        let address = self.allocate_in(&mut subnets, subnet)?;
        self.dump(&subnets)?;
        trace!("allocated {} from {}", address, subnet);
        Ok(address)
    }

    fn allocate_in(&self, subnets: &mut Subnets, subnet: &Ipv4Net) -> RuntimeResult<Ipv4Addr> {
        let one_count = subnet.host_bits();
        let entry = subnets.0.entry(subnet.to_string()).or_insert_with(|| "0".repeat(one_count));

        if entry.len() < one_count {
            entry.push_str(&"0".repeat(one_count - entry.len()));
        }

        let index = entry.find('0').ok_or_else(|| {
            RuntimeError::ResourceExhaustion(format!("no free address in subnet {}", subnet))
        })?;

        let mut bytes: Vec<u8> = entry.bytes().collect();
        bytes[index] = b'1';
        *entry = String::from_utf8(bytes).unwrap();

        Ok(subnet.address_at(index as u32))
    }

    /// Allocates `subnet`'s gateway address specifically, for network
    /// creation. Bit 0 of a fresh bitmap always maps to `.1`, so the
    /// first ordinary `allocate` on a new subnet naturally returns the
    /// gateway.
    pub fn allocate_gateway(&self, subnet: &Ipv4Net) -> RuntimeResult<Ipv4Addr> {
        let address = self.allocate(subnet)?;
        debug_assert_eq!(address, subnet.gateway());
        Ok(address)
    }

    /// Marks `address`'s slot in `subnet`'s bitmap free again. A release of
    /// an address never allocated (or a subnet never seen) is a no-op, not
    /// an error - the caller only has a best-effort obligation on release.
    pub fn release(&self, subnet: &Ipv4Net, address: Ipv4Addr) -> RuntimeResult<()> {
        let mut subnets = self.load()?;

        if let Some(entry) = subnets.0.get_mut(&subnet.to_string()) {
            let index = subnet.index_of(address) as usize;
            let mut bytes: Vec<u8> = entry.bytes().collect();
            if index < bytes.len() {
                bytes[index] = b'0';
                *entry = String::from_utf8(bytes).unwrap();
                self.dump(&subnets)?;
            }
        }

        Ok(())
    }

    fn load(&self) -> RuntimeResult<Subnets> {
        match fs::read_to_string(&self.allocator_path) {
            Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_default()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Subnets::default()),
            Err(err) => Err(RuntimeError::from(err)),
        }
    }

    fn dump(&self, subnets: &Subnets) -> RuntimeResult<()> {
        if let Some(parent) = self.allocator_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.allocator_path, serde_json::to_string(subnets).unwrap())?;
        Ok(())
    }
}

/// An IPv4 network in CIDR notation, e.g. `192.168.0.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    pub address: Ipv4Addr,
    pub prefix_len: u32,
}

impl Ipv4Net {
    pub fn new(address: Ipv4Addr, prefix_len: u32) -> Ipv4Net {
        Ipv4Net { address, prefix_len }
    }

    pub fn parse(raw: &str) -> RuntimeResult<Ipv4Net> {
        let (addr, prefix) = raw
            .split_once('/')
            .ok_or_else(|| RuntimeError::Configuration(format!("not a CIDR: {}", raw)))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|_| RuntimeError::Configuration(format!("bad address in CIDR: {}", raw)))?;
        let prefix_len: u32 = prefix
            .parse()
            .map_err(|_| RuntimeError::Configuration(format!("bad prefix in CIDR: {}", raw)))?;
        Ok(Ipv4Net { address, prefix_len })
    }

    pub fn subnet_mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    fn network_bits(&self) -> u32 {
        u32::from(self.address) & self.subnet_mask()
    }

    /// Number of host addresses counted in the allocator bitmap - the full
    /// address range, network and broadcast included, matching the
    /// upstream allocator's one-bit-per-address scheme.
    pub fn host_bits(&self) -> usize {
        1usize << (32 - self.prefix_len)
    }

    /// Bit `index` of the allocator's bitmap maps to `.{index + 1}` -
    /// the bitmap is 0-indexed but addresses are handed out starting at
    /// the network's first host address, not the network address itself.
    pub fn address_at(&self, index: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.network_bits() + index + 1)
    }

    pub fn index_of(&self, address: Ipv4Addr) -> u32 {
        u32::from(address) - self.network_bits() - 1
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.address_at(0)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network_bits() | !self.subnet_mask())
    }
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl std::str::FromStr for Ipv4Net {
    type Err = RuntimeError;

    fn from_str(s: &str) -> RuntimeResult<Ipv4Net> {
        Ipv4Net::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> Ipv4Net {
        Ipv4Net::parse("192.168.0.0/24").unwrap()
    }

    #[test]
    fn parses_cidr_and_computes_mask() {
        let n = net();
        assert_eq!(n.subnet_mask(), 0xFFFFFF00);
        assert_eq!(n.host_bits(), 256);
    }

    #[test]
    fn address_and_index_roundtrip() {
        let n = net();
        let addr = n.address_at(5);
        assert_eq!(addr, Ipv4Addr::new(192, 168, 0, 6));
        assert_eq!(n.index_of(addr), 5);
    }

    #[test]
    fn broadcast_and_gateway_are_well_known_offsets() {
        let n = net();
        assert_eq!(n.gateway(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(n.broadcast(), Ipv4Addr::new(192, 168, 0, 255));
    }

    #[test]
    fn allocate_then_release_frees_the_same_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ipam = IpAddressManager::at(dir.path().join("subnet.json"));
        let n = net();

        let first = ipam.allocate(&n).unwrap();
        let second = ipam.allocate(&n).unwrap();
        assert_ne!(first, second);

        ipam.release(&n, first).unwrap();
        let third = ipam.allocate(&n).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn first_allocation_on_a_fresh_subnet_is_the_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let ipam = IpAddressManager::at(dir.path().join("subnet.json"));
        let n = net();

        assert_eq!(ipam.allocate_gateway(&n).unwrap(), n.gateway());
    }

    #[test]
    fn allocate_persists_across_manager_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnet.json");
        let n = net();

        let first = IpAddressManager::at(path.clone()).allocate(&n).unwrap();
        let second = IpAddressManager::at(path).allocate(&n).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn gateway_allocation_sets_only_bit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnet.json");
        let n = net();

        IpAddressManager::at(path.clone()).allocate_gateway(&n).unwrap();

        let subnets = IpAddressManager::at(path).load().unwrap();
        let bitmap = &subnets.0[&n.to_string()];
        assert_eq!(bitmap, &format!("1{}", "0".repeat(255)));
    }
}
