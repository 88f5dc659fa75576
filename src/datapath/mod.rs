//! Unnumbered-PTP datapath: wires a veth pair between the host and a
//! container netns, borrowing the container's address from the host's
//! existing interfaces rather than assigning it a subnet of its own.

pub mod add;
pub mod del;
pub mod policy;

use std::net::Ipv4Addr;

use crate::cni::{CniIpConfig, CniResult};

/// An address bound on the host interface the veth pair borrows from.
#[derive(Debug, Clone)]
pub struct HostAddr {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

/// Picks the container-side IPs out of a chained plugin's previous result.
/// CNI 0.3.0+ results tag each IP with the index of the interface it
/// belongs to; anything not tagged, or tagged with an unrecognized index,
/// is assumed to be container-side.
pub fn container_ips(result: &CniResult, ifname: &str) -> Vec<Ipv4Addr> {
    result
        .ips
        .iter()
        .filter(|ipc| belongs_to_container(result, ipc, ifname))
        .map(|ipc| ipc.address.ip())
        .collect()
}

fn belongs_to_container(result: &CniResult, ipc: &CniIpConfig, ifname: &str) -> bool {
    match ipc.interface {
        None => true,
        Some(idx) => match result.interfaces.get(idx) {
            Some(iface) => iface.name == ifname,
            None => true,
        },
    }
}

/// Tags the MASQUERADE rule so teardown can find it again with an exact
/// `-C` match on the full rule spec, the same way `iptables -C` is used
/// everywhere else in this codebase for idempotency.
pub fn masq_comment(network_name: &str, container_id: &str) -> String {
    format!("name: \"{network_name}\" id: \"{container_id}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::{CniInterface, CniIpConfig};

    #[test]
    fn container_ips_skips_host_tagged_entries() {
        let mut result = CniResult::default();
        result.interfaces.push(CniInterface { name: "veth-host".to_string(), mac: None, sandbox: None });
        result.interfaces.push(CniInterface { name: "eth0".to_string(), mac: None, sandbox: None });
        result.ips.push(CniIpConfig {
            version: "4".to_string(),
            address: "10.0.0.5/32".parse().unwrap(),
            gateway: None,
            interface: Some(0),
        });
        result.ips.push(CniIpConfig {
            version: "4".to_string(),
            address: "10.0.0.6/32".parse().unwrap(),
            gateway: None,
            interface: Some(1),
        });
        let ips = container_ips(&result, "eth0");
        assert_eq!(ips, vec!["10.0.0.6".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn masq_comment_includes_both_identifiers() {
        let comment = masq_comment("mynet", "abc123");
        assert!(comment.contains("mynet"));
        assert!(comment.contains("abc123"));
    }
}
