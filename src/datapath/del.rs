//! Unnumbered-PTP DEL: idempotent teardown. Every step tolerates a
//! link, rule, or iptables entry that is already gone — DEL can be
//! called more than once for the same pod.

use std::net::Ipv4Addr;
use std::path::Path;

use super::masq_comment;
use crate::cni::PtpConfig;
use crate::errors::{Result, VniError};
use crate::kernel::iptables::IptablesOps;
use crate::kernel::KernelOps;

pub struct DelContext<'a> {
    pub kernel: &'a dyn KernelOps,
    pub iptables: &'a dyn IptablesOps,
}

/// Returns the container-side IPv4 addresses recovered before teardown
/// (only populated when `ipMasq` is set, matching the upstream plugin's
/// own gating), so the caller can start their registry reuse cooldown.
pub fn del(
    ctx: &DelContext,
    network_name: &str,
    container_id: &str,
    netns_path: Option<&Path>,
    ifname: &str,
    container_interface: &str,
    config: &PtpConfig,
) -> Result<Vec<Ipv4Addr>> {
    let Some(netns_path) = netns_path else {
        return Ok(Vec::new());
    };

    let mut peer_index: Option<i32> = None;
    let mut container_ips = Vec::new();
    let lookup = ctx.kernel.run_in_netns(netns_path, &mut || {
        if let Ok(idx) = ctx.kernel.veth_peer_index(netns_path, container_interface) {
            peer_index = Some(idx);
        }
        if config.ip_masq {
            if let Ok(addrs) = ctx.kernel.addresses(ifname) {
                container_ips = addrs;
            }
        }
        Ok(())
    });
    // A netns that is already gone is not an error; DEL must be
    // idempotent against a pod that was torn down by a previous call.
    if lookup.is_err() {
        return Ok(Vec::new());
    }

    if config.ip_masq {
        let comment = masq_comment(network_name, container_id);
        let spec = ["-o", ifname, "-j", "MASQUERADE", "-m", "comment", "--comment", comment.as_str()];
        let _ = ctx.iptables.delete_if_present("nat", "POSTROUTING", &spec);
        let spec_random_fully =
            ["-o", ifname, "-j", "MASQUERADE", "--random-fully", "-m", "comment", "--comment", comment.as_str()];
        let _ = ctx.iptables.delete_if_present("nat", "POSTROUTING", &spec_random_fully);
    }

    if let Some(index) = peer_index {
        if let Ok(name) = ctx.kernel.link_name_by_index(index) {
            let _ = ctx.kernel.del_iif_rule(&name);
            ctx.kernel
                .link_delete(&name)
                .map_err(|e| VniError::KernelOpFailure { op: "LinkDel", detail: e.to_string() })?;
        }
    }

    Ok(container_ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeKernel;
    use crate::kernel::iptables::fake::FakeIptables;

    fn config() -> PtpConfig {
        PtpConfig {
            name: "test-net".to_string(),
            cni_version: "0.4.0".to_string(),
            prev_result: None,
            ip_masq: true,
            host_interface: "eth0".to_string(),
            container_interface: "eth0".to_string(),
            mtu: Some(1500),
            route_table_start: 256,
            node_port_mark: 0x2000,
            node_ports: "30000:32767".to_string(),
        }
    }

    #[test]
    fn del_still_removes_link_without_masq() {
        let kernel = FakeKernel::new();
        kernel.index_to_name.lock().unwrap().insert(101, "veth-host".to_string());
        *kernel.next_peer_index.lock().unwrap() = 101;
        kernel.iif_rules.lock().unwrap().insert("veth-host".to_string(), 256);
        let iptables = FakeIptables::default();
        let ctx = DelContext { kernel: &kernel, iptables: &iptables };
        let mut cfg = config();
        cfg.ip_masq = false;

        let ips = del(&ctx, "test-net", "abcd", Some(Path::new("/proc/1/ns/net")), "eth0", "eth0", &cfg).unwrap();
        assert!(ips.is_empty());
        assert!(kernel.deleted_links.lock().unwrap().contains("veth-host"));
    }

    #[test]
    fn del_removes_link_and_masq_rule_when_peer_found() {
        let kernel = FakeKernel::new();
        kernel.index_to_name.lock().unwrap().insert(101, "veth-host".to_string());
        *kernel.next_peer_index.lock().unwrap() = 101;
        kernel.iif_rules.lock().unwrap().insert("veth-host".to_string(), 256);
        let iptables = FakeIptables::default();
        let ctx = DelContext { kernel: &kernel, iptables: &iptables };

        del(&ctx, "test-net", "abcd", Some(Path::new("/proc/1/ns/net")), "eth0", "eth0", &config()).unwrap();
        assert!(kernel.deleted_links.lock().unwrap().contains("veth-host"));
        assert!(!kernel.iif_rules.lock().unwrap().contains_key("veth-host"));
    }
}
