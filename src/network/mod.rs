pub mod bridge;
pub mod ipam;

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{info, trace};
use serde::{Deserialize, Serialize};

use crate::linux;
use crate::model::{RuntimeError, RuntimeResult};
use ipam::{IpAddressManager, Ipv4Net};

const NETWORK_STORE_DIR: &str = "/root/ddocker-network/network";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub subnet: String,
    pub driver: String,
}

/// A container's attachment to a network: the veth pair's host-side
/// name, the address it was allocated, and any `-p HOST:CONTAINER`
/// mappings installed for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub device: String,
    pub ip_address: Ipv4Addr,
    pub network: String,
    pub port_mappings: Vec<(u16, u16)>,
}

/// Owns the set of known networks and drives container attachment. Holds
/// no process-wide state - callers construct one per invocation and pass
/// it by reference, rather than reaching for a package-level singleton.
pub struct NetworkManager {
    networks: HashMap<String, Network>,
    ipam: IpAddressManager,
}

impl NetworkManager {
    /// Loads every network definition under the store directory.
    pub fn load() -> RuntimeResult<NetworkManager> {
        let mut networks = HashMap::new();
        fs::create_dir_all(NETWORK_STORE_DIR)?;

        for entry in fs::read_dir(NETWORK_STORE_DIR)? {
            let entry = entry?;
            let content = fs::read_to_string(entry.path())?;
            if let Ok(network) = serde_json::from_str::<Network>(&content) {
                networks.insert(network.name.clone(), network);
            }
        }

        Ok(NetworkManager { networks, ipam: IpAddressManager::new() })
    }

    pub fn list(&self) -> Vec<&Network> {
        let mut networks: Vec<&Network> = self.networks.values().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    /// Creates a bridge-backed network: allocates the gateway address
    /// from `subnet`, brings up the bridge, and persists the definition.
    pub fn create(&mut self, driver: &str, subnet_raw: &str, name: &str) -> RuntimeResult<()> {
        if driver != "bridge" {
            return Err(RuntimeError::Configuration(format!("unsupported network driver: {}", driver)));
        }
        if self.networks.contains_key(name) {
            return Err(RuntimeError::Collision(format!("network {} already exists", name)));
        }

        let subnet = Ipv4Net::parse(subnet_raw)?;
        self.ipam.allocate_gateway(&subnet)?;
        bridge::create(name, &subnet)?;

        let network = Network { name: name.to_owned(), subnet: subnet.to_string(), driver: driver.to_owned() };
        self.persist(&network)?;
        self.networks.insert(name.to_owned(), network);
        info!("created network {} ({})", name, subnet);
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> RuntimeResult<()> {
        let network = self
            .networks
            .remove(name)
            .ok_or_else(|| RuntimeError::Configuration(format!("no such network: {}", name)))?;

        let subnet = Ipv4Net::parse(&network.subnet)?;
        bridge::delete(name, &subnet)?;
        fs::remove_file(self.store_path(name))?;
        Ok(())
    }

    /// Attaches a just-started container (by its pid, so its network
    /// namespace is `/proc/<pid>/ns/net`) to `network_name`: allocates an
    /// address, wires a veth pair into the bridge, then configures the
    /// namespace side from a dedicated, single-use thread.
    ///
    /// A freshly spawned `std::thread` is its own OS thread for its
    /// entire lifetime, so `setns`-ing it and letting it exit afterward
    /// satisfies the "pin the calling thread while inside the target
    /// namespace" requirement without any manual locking: no other code
    /// ever runs on that thread to observe the swapped namespace, and the
    /// thread is discarded rather than returned to a pool.
    pub fn connect(&self, network_name: &str, container_id: &str, pid: i32, port_mappings: &[(u16, u16)]) -> RuntimeResult<Endpoint> {
        let network = self
            .networks
            .get(network_name)
            .ok_or_else(|| RuntimeError::Configuration(format!("no such network: {}", network_name)))?;
        let subnet = Ipv4Net::parse(&network.subnet)?;

        let endpoint_id = format!("{}-{}", container_id, network_name);

        let address = self.ipam.allocate(&subnet)?;
        let (host_side, ns_side) = bridge::create_veth_pair(network_name, &endpoint_id)?;
        bridge::move_to_namespace(&ns_side, pid)?;

        configure_endpoint_in_namespace(pid, &ns_side, address, subnet.prefix_len, subnet.gateway())?;

        for (host_port, container_port) in port_mappings {
            bridge::add_port_mapping(*host_port, address, *container_port)?;
        }

        trace!("connected {} to {} as {} ({})", container_id, network_name, host_side, address);

        Ok(Endpoint {
            id: endpoint_id,
            device: host_side,
            ip_address: address,
            network: network_name.to_owned(),
            port_mappings: port_mappings.to_vec(),
        })
    }

    /// Releases an endpoint's address and port mappings. The veth pair
    /// itself disappears on its own once the container's network
    /// namespace is destroyed.
    pub fn disconnect(&self, endpoint: &Endpoint) -> RuntimeResult<()> {
        let network = self
            .networks
            .get(&endpoint.network)
            .ok_or_else(|| RuntimeError::Configuration(format!("no such network: {}", endpoint.network)))?;
        let subnet = Ipv4Net::parse(&network.subnet)?;

        self.ipam.release(&subnet, endpoint.ip_address)?;
        for (host_port, container_port) in &endpoint.port_mappings {
            bridge::remove_port_mapping(*host_port, endpoint.ip_address, *container_port)?;
        }
        Ok(())
    }

    fn store_path(&self, name: &str) -> PathBuf {
        Path::new(NETWORK_STORE_DIR).join(name)
    }

    fn persist(&self, network: &Network) -> RuntimeResult<()> {
        fs::write(self.store_path(&network.name), serde_json::to_string(network).unwrap())?;
        Ok(())
    }
}

/// Enters the network namespace of `pid` on a throwaway thread, runs the
/// veth rename/address/route setup there, and restores the calling
/// thread's own (host) namespace before the thread exits - matching the
/// upstream runtime's "enter, configure, restore" sequence, here made
/// safe by construction rather than by a held lock.
fn configure_endpoint_in_namespace(pid: i32, ns_side: &str, address: Ipv4Addr, prefix_len: u32, gateway: Ipv4Addr) -> RuntimeResult<()> {
    let ns_side = ns_side.to_owned();

    std::thread::spawn(move || -> RuntimeResult<()> {
        let self_ns = fs::File::open("/proc/self/ns/net")?;
        let target_ns = fs::File::open(format!("/proc/{}/ns/net", pid))?;

        linux::setns(target_ns.as_raw_fd(), libc::CLONE_NEWNET)?;
        let result = bridge::configure_in_namespace(&ns_side, address, prefix_len, gateway);
        linux::setns(self_ns.as_raw_fd(), libc::CLONE_NEWNET)?;

        result
    })
    .join()
    .map_err(|_| RuntimeError::Environment("namespace configuration thread panicked".to_owned()))?
}
