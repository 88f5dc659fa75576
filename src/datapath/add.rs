//! Unnumbered-PTP ADD: creates the veth pair, wires routes on both ends,
//! installs policy routing for pod-to-VPC traffic, and (optionally) sets
//! up MASQUERADE and node-port marking.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;

use super::policy::{add_policy_rules, NODE_PORT_RULE_PRIORITY};
use super::{container_ips, masq_comment, HostAddr};
use crate::cni::{CniInterface, CniResult, PtpConfig};
use crate::errors::{Result, VniError};
use crate::kernel::KernelOps;
use crate::kernel::iptables::IptablesOps;

pub struct AddContext<'a> {
    pub kernel: &'a dyn KernelOps,
    pub iptables: &'a dyn IptablesOps,
}

/// Wires the datapath and returns the (unmodified, save for interfaces)
/// CNI result to pass through to the next consumer.
pub fn add(
    ctx: &AddContext,
    network_name: &str,
    container_id: &str,
    netns_path: &Path,
    ifname: &str,
    config: &PtpConfig,
    mut result: CniResult,
) -> Result<CniResult> {
    let container_ipv4s = container_ips(&result, ifname);
    if container_ipv4s.is_empty() {
        return Err(VniError::KernelOpFailure { op: "cmdAdd", detail: "no container IPs in prevResult".into() });
    }
    let container_ipv4 = container_ipv4s[0];

    let host_addrs = ctx
        .kernel
        .addresses(&config.host_interface)
        .map_err(|e| VniError::KernelOpFailure { op: "AddrList", detail: e.to_string() })?;
    if host_addrs.is_empty() {
        return Err(VniError::KernelOpFailure {
            op: "AddrList",
            detail: format!("{} has no addresses", config.host_interface),
        });
    }
    let host_addrs: Vec<HostAddr> = host_addrs.into_iter().map(|ip| HostAddr { ip, prefix: 32 }).collect();

    let mtu = config.mtu.unwrap_or_else(|| ctx.kernel.get_mtu(&config.host_interface).unwrap_or(1500));

    let mut veth = None;
    ctx.kernel
        .run_in_netns(netns_path, &mut || {
            let pair = ctx
                .kernel
                .create_veth_into_netns(&format!("veth{}", container_id_suffix(container_id)), &config.container_interface, mtu, netns_path)?;

            for host_addr in &host_addrs {
                ctx.kernel.add_scope_link_route(&pair.container_name, host_addr.ip)?;
            }
            ctx.kernel.add_default_route(&pair.container_name, host_addrs[0].ip)?;
            for ip in &container_ipv4s {
                let _ = ctx.kernel.gratuitous_arp(&pair.container_name, *ip);
            }

            if config.ip_masq {
                ctx.iptables.append_unique(
                    "nat",
                    "POSTROUTING",
                    &masq_spec(ifname, ctx.iptables.has_random_fully(), &masq_comment(network_name, container_id)),
                )?;
            }

            veth = Some(pair);
            Ok(())
        })
        .map_err(|e| VniError::KernelOpFailure { op: "setupContainerVeth", detail: e.to_string() })?;

    let veth = veth.ok_or(VniError::InterfaceSettleFailure)?;

    for ip in &container_ipv4s {
        ctx.kernel
            .add_scope_link_route(&veth.host_name, *ip)
            .map_err(|e| VniError::KernelOpFailure { op: "RouteAdd", detail: e.to_string() })?;
    }

    let routes: Vec<(Ipv4Network, Ipv4Addr)> = result.routes.iter().map(|r| (r.dst, container_ipv4)).collect();
    if !routes.is_empty() {
        add_policy_rules(ctx.kernel, &veth.host_name, &routes, config.route_table_start)?;
    }

    for host_addr in &host_addrs {
        let _ = ctx.kernel.gratuitous_arp(&veth.host_name, host_addr.ip);
    }

    setup_node_port_rule(ctx, &config.host_interface, &config.node_ports, config.node_port_mark)?;

    result
        .interfaces
        .push(CniInterface { name: veth.host_name, mac: Some(veth.host_mac), sandbox: None });
    Ok(result)
}

fn setup_node_port_rule(ctx: &AddContext, host_if: &str, node_ports: &str, mark: u32) -> Result<()> {
    let mark_str = mark.to_string();
    ctx.iptables
        .append_unique(
            "mangle",
            "PREROUTING",
            &["-i", host_if, "-p", "tcp", "--dport", node_ports, "-j", "CONNMARK", "--set-mark", &mark_str, "-m", "comment", "--comment", "NodePort Mark"],
        )
        .map_err(|e| VniError::KernelOpFailure { op: "iptables", detail: e.to_string() })?;
    ctx.iptables
        .append_unique(
            "mangle",
            "PREROUTING",
            &["-i", host_if, "-p", "udp", "--dport", node_ports, "-j", "CONNMARK", "--set-mark", &mark_str, "-m", "comment", "--comment", "NodePort Mark"],
        )
        .map_err(|e| VniError::KernelOpFailure { op: "iptables", detail: e.to_string() })?;
    ctx.iptables
        .append_unique(
            "mangle",
            "PREROUTING",
            &["-i", "veth+", "-j", "CONNMARK", "--restore-mark", "-m", "comment", "--comment", "NodePort Mark"],
        )
        .map_err(|e| VniError::KernelOpFailure { op: "iptables", detail: e.to_string() })?;

    ctx.kernel
        .set_rp_filter_loose(host_if)
        .map_err(|e| VniError::KernelOpFailure { op: "sysctl", detail: e.to_string() })?;

    let exists = ctx
        .kernel
        .fwmark_rule_exists(mark, 254, NODE_PORT_RULE_PRIORITY)
        .map_err(|e| VniError::KernelOpFailure { op: "RuleList", detail: e.to_string() })?;
    if !exists {
        ctx.kernel
            .add_fwmark_rule(mark, 254, NODE_PORT_RULE_PRIORITY)
            .map_err(|e| VniError::KernelOpFailure { op: "RuleAdd", detail: e.to_string() })?;
    }
    Ok(())
}

fn masq_spec<'a>(out_if: &'a str, random_fully: bool, comment: &'a str) -> Vec<&'a str> {
    let mut spec = vec!["-o", out_if, "-j", "MASQUERADE"];
    if random_fully {
        spec.push("--random-fully");
    }
    spec.extend_from_slice(&["-m", "comment", "--comment", comment]);
    spec
}

fn container_id_suffix(container_id: &str) -> &str {
    let len = container_id.len().min(8);
    &container_id[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::{CniIpConfig, CniRoute};
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
    fn add_wires_veth_and_masq_rule() {
        let kernel = FakeKernel::new();
        kernel.bound.lock().unwrap().push(crate::kernel::BoundAddr {
            ip: "10.0.1.1".parse().unwrap(),
            label: "eth0".to_string(),
        });
        let iptables = FakeIptables::default();
        let ctx = AddContext { kernel: &kernel, iptables: &iptables };

        let mut result = CniResult::default();
        result.ips.push(CniIpConfig {
            version: "4".to_string(),
            address: "10.0.1.50/24".parse().unwrap(),
            gateway: Some("10.0.1.1".parse().unwrap()),
            interface: None,
        });
        result.routes.push(CniRoute { dst: "10.0.0.0/16".parse().unwrap(), gw: Some("10.0.1.1".parse().unwrap()) });

        let out = add(&ctx, "test-net", "abcd1234", Path::new("/proc/1/ns/net"), "eth0", &config(), result).unwrap();
        assert_eq!(out.interfaces.len(), 1);
        assert!(iptables
            .rules
            .lock()
            .unwrap()
            .iter()
            .any(|(table, chain, _)| table == "nat" && chain == "POSTROUTING"));
    }
}
