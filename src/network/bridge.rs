use std::net::{IpAddr, Ipv4Addr};
use std::process::{Command, Output};

use log::{info, trace, warn};

use crate::model::{RuntimeError, RuntimeResult};

use super::ipam::Ipv4Net;

/// Runs `ip <args>`, turning a non-zero exit status into a `RuntimeError`.
pub fn ip_command(args: &[&str]) -> RuntimeResult<Output> {
    run_command("ip", args)
}

/// Runs `iptables <args>`.
pub fn iptables_command(args: &[&str]) -> RuntimeResult<Output> {
    run_command("iptables", args)
}

fn run_command(program: &str, args: &[&str]) -> RuntimeResult<Output> {
    trace!("{} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(RuntimeError::Environment(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output)
}

/// Looks up the interface the host would use to reach the public
/// internet, by resolving a well-known hostname and asking the routing
/// table which device serves that destination. Used to scope the
/// bridge's forwarding rules to the host's actual uplink rather than
/// every interface.
pub fn find_internet_interface() -> RuntimeResult<String> {
    let ips = dns_lookup::lookup_host("google.com")
        .map_err(|err| RuntimeError::Environment(format!("DNS lookup failed: {}", err)))?;

    for ip in ips {
        if let IpAddr::V4(ip) = ip {
            let output = ip_command(&["route", "get", &ip.to_string()])?;
            let text = String::from_utf8_lossy(&output.stdout);
            return text
                .split_whitespace()
                .nth(4)
                .map(|s| s.to_owned())
                .ok_or_else(|| RuntimeError::Environment("no interface found in route output".to_owned()));
        }
    }

    Err(RuntimeError::Environment("no IPv4 address found for google.com".to_owned()))
}

/// Creates a Linux bridge for `subnet`, brings it up, assigns it the
/// subnet's gateway address, and installs the MASQUERADE and FORWARD
/// rules that let containers on this bridge reach outside networks. A
/// failure to determine the host's internet-facing interface is logged
/// and skipped rather than failing the whole bridge creation - the
/// bridge and NAT rule still work for host-to-container traffic.
pub fn create(bridge_name: &str, subnet: &Ipv4Net) -> RuntimeResult<()> {
    ip_command(&["link", "add", bridge_name, "type", "bridge"])?;
    ip_command(&[
        "addr",
        "add",
        &format!("{}/{}", subnet.gateway(), subnet.prefix_len),
        "dev",
        bridge_name,
    ])?;
    ip_command(&["link", "set", bridge_name, "up"])?;

    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")?;

    iptables_command(&["-A", "FORWARD", "-i", bridge_name, "-o", bridge_name, "-j", "ACCEPT"])?;
    iptables_command(&[
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-s",
        &subnet.to_string(),
        "!",
        "-o",
        bridge_name,
        "-j",
        "MASQUERADE",
    ])?;

    match find_internet_interface() {
        Ok(physical_interface) => {
            iptables_command(&["-A", "FORWARD", "-i", &physical_interface, "-o", bridge_name, "-j", "ACCEPT"])?;
            iptables_command(&["-A", "FORWARD", "-o", &physical_interface, "-i", bridge_name, "-j", "ACCEPT"])?;
            info!("bridge {} uplinked via {}", bridge_name, physical_interface);
        }
        Err(err) => warn!("could not determine internet interface for {}: {}", bridge_name, err),
    }

    Ok(())
}

/// Removes the bridge and its MASQUERADE rule. Called with the same
/// `subnet` that `create` used, since `iptables -D` needs the exact rule
/// text to match.
pub fn delete(bridge_name: &str, subnet: &Ipv4Net) -> RuntimeResult<()> {
    if let Err(err) = iptables_command(&[
        "-t",
        "nat",
        "-D",
        "POSTROUTING",
        "-s",
        &subnet.to_string(),
        "!",
        "-o",
        bridge_name,
        "-j",
        "MASQUERADE",
    ]) {
        warn!("failed to remove MASQUERADE rule for {}: {}", bridge_name, err);
    }

    ip_command(&["link", "del", bridge_name])?;
    Ok(())
}

/// Derives the host-side and namespace-side veth names from an endpoint
/// id, keeping both within `IFNAMSIZ` (15 bytes including the nul).
pub fn veth_names(endpoint_id: &str) -> (String, String) {
    let prefix = &endpoint_id[..5.min(endpoint_id.len())];
    let host_side = prefix.to_owned();
    let ns_side = format!("cif-{}", prefix);
    (host_side, ns_side)
}

/// Creates a veth pair, attaches one end to the bridge, and hands the
/// other end off to the caller by name so it can be moved into the
/// container's network namespace.
pub fn create_veth_pair(bridge_name: &str, endpoint_id: &str) -> RuntimeResult<(String, String)> {
    let (host_side, ns_side) = veth_names(endpoint_id);

    ip_command(&["link", "add", &host_side, "type", "veth", "peer", "name", &ns_side])?;
    ip_command(&["link", "set", &host_side, "master", bridge_name])?;
    ip_command(&["link", "set", &host_side, "up"])?;

    Ok((host_side, ns_side))
}

/// Moves `ns_side` into the namespace of `pid`, then (inside that
/// namespace) renames it to `eth0`, assigns `address/prefix_len`, brings
/// it up along with loopback, and adds a default route via `gateway`.
/// Must run with the calling thread already `setns`'d into the target
/// namespace.
pub fn configure_in_namespace(ns_side: &str, address: Ipv4Addr, prefix_len: u32, gateway: Ipv4Addr) -> RuntimeResult<()> {
    ip_command(&["link", "set", ns_side, "name", "eth0"])?;
    ip_command(&["link", "set", "eth0", "up"])?;
    ip_command(&["link", "set", "lo", "up"])?;
    ip_command(&["addr", "add", &format!("{}/{}", address, prefix_len), "dev", "eth0"])?;
    ip_command(&["route", "add", "default", "via", &gateway.to_string()])?;
    Ok(())
}

pub fn move_to_namespace(ns_side: &str, pid: i32) -> RuntimeResult<()> {
    ip_command(&["link", "set", ns_side, "netns", &pid.to_string()])?;
    Ok(())
}

/// Installs a host-port -> container-port DNAT rule, e.g. for `-p
/// 8080:80`.
pub fn add_port_mapping(host_port: u16, container_ip: Ipv4Addr, container_port: u16) -> RuntimeResult<()> {
    iptables_command(&[
        "-t",
        "nat",
        "-A",
        "PREROUTING",
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        &host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{}:{}", container_ip, container_port),
    ])
    .map(|_| ())
}

pub fn remove_port_mapping(host_port: u16, container_ip: Ipv4Addr, container_port: u16) -> RuntimeResult<()> {
    iptables_command(&[
        "-t",
        "nat",
        "-D",
        "PREROUTING",
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        &host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{}:{}", container_ip, container_port),
    ])
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_are_derived_from_the_endpoint_id_and_stay_short() {
        let (host_side, ns_side) = veth_names("abcdefghij");
        assert_eq!(host_side, "abcde");
        assert_eq!(ns_side, "cif-abcde");
        assert!(host_side.len() <= 15, "interface names must fit IFNAMSIZ");
        assert!(ns_side.len() <= 15, "interface names must fit IFNAMSIZ");
    }
}
