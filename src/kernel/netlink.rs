//! Synchronous netlink transport. Unlike the async `rtnetlink` crate, this
//! opens one `netlink-sys` socket per call and blocks on it directly,
//! matching the single-OS-thread constraint: there is no runtime to hand
//! control back to between a netns switch and the netlink calls that must
//! happen inside it.

use std::collections::HashSet;
use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST};
use netlink_packet_route::{
    link::{LinkAttribute, LinkFlag, LinkMessage},
    route::{RouteAttribute, RouteMessage, RouteScope},
    rule::{RuleAttribute, RuleMessage},
    RouteNetlinkMessage,
};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use pnet_datalink::{Channel, MacAddr};

use super::{BoundAddr, KernelOps, VethPair};

pub struct NetlinkOps;

impl NetlinkOps {
    pub fn new() -> Self {
        NetlinkOps
    }

    fn socket(&self) -> anyhow::Result<Socket> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(socket)
    }

    /// Sends a single netlink request expecting an ACK and blocks until it
    /// arrives, surfacing any NACK as an error.
    fn request_ack(&self, payload: RouteNetlinkMessage, extra_flags: u16) -> anyhow::Result<()> {
        let mut msg = NetlinkMessage::from(payload);
        msg.header.flags = NLM_F_REQUEST | NLM_F_ACK | extra_flags;
        msg.finalize();
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);

        let socket = self.socket()?;
        socket.send(&buf, 0)?;

        let mut recv_buf = vec![0u8; 8192];
        let (n, _) = socket.recv_from(&mut recv_buf, 0)?;
        let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[..n])?;
        match reply.payload {
            NetlinkPayload::Error(e) if e.code.is_some() => {
                anyhow::bail!("netlink error: {:?}", e.code)
            }
            _ => Ok(()),
        }
    }

    fn dump_rules(&self, family: u8) -> anyhow::Result<Vec<RuleMessage>> {
        use netlink_packet_route::rule::RuleMessage as Rm;
        let mut rule = Rm::default();
        rule.header.family = family.into();
        let mut msg = NetlinkMessage::from(RouteNetlinkMessage::GetRule(rule));
        msg.header.flags = NLM_F_REQUEST | netlink_packet_core::NLM_F_DUMP;
        msg.finalize();
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);

        let socket = self.socket()?;
        socket.send(&buf, 0)?;

        let mut out = Vec::new();
        let mut recv_buf = vec![0u8; 65536];
        loop {
            let (n, _) = socket.recv_from(&mut recv_buf, 0)?;
            let mut offset = 0;
            let mut done = false;
            while offset < n {
                let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..n])?;
                let len = reply.header.length as usize;
                match reply.payload {
                    NetlinkPayload::Done(_) => {
                        done = true;
                        break;
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRule(r)) => out.push(r),
                    _ => {}
                }
                if len == 0 {
                    break;
                }
                offset += len;
            }
            if done {
                break;
            }
        }
        Ok(out)
    }
}

impl Default for NetlinkOps {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelOps for NetlinkOps {
    fn bound_ipv4s(&self) -> anyhow::Result<Vec<BoundAddr>> {
        // Root namespace plus every named namespace under /var/run/netns,
        // mirroring the scan the free-IP scanner relies on.
        let mut all = Vec::new();
        all.extend(bound_ipv4s_in_current_ns()?);
        if let Ok(entries) = std::fs::read_dir("/var/run/netns") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let path = entry.path();
                let mut collected = Vec::new();
                self.run_in_netns(&path, &mut || {
                    collected = bound_ipv4s_in_current_ns()?;
                    Ok(())
                })
                .map_err(|e| anyhow::anyhow!("namespace {name}: {e}"))?;
                all.extend(collected);
            }
        }
        Ok(all)
    }

    fn link_up(&self, name: &str) -> anyhow::Result<()> {
        let mut link = LinkMessage::default();
        link.attributes.push(LinkAttribute::IfName(name.to_string()));
        link.header.flags = vec![LinkFlag::Up];
        self.request_ack(RouteNetlinkMessage::SetLink(link), 0)
    }

    fn link_up_poll(&self, name: &str, timeout: Duration) -> anyhow::Result<()> {
        let start = Instant::now();
        loop {
            if self.link_up(name).is_ok() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                anyhow::bail!("interface {name} did not come up in time");
            }
            sleep(Duration::from_millis(100));
        }
    }

    fn get_mtu(&self, name: &str) -> anyhow::Result<u32> {
        // ioctl-based MTU read, the same mechanism `nl.GetMtu` used.
        ioctl_get_mtu(name)
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> anyhow::Result<()> {
        ioctl_set_mtu(name, mtu)
    }

    fn link_delete(&self, name: &str) -> anyhow::Result<()> {
        let mut link = LinkMessage::default();
        link.attributes.push(LinkAttribute::IfName(name.to_string()));
        self.request_ack(RouteNetlinkMessage::DelLink(link), 0)
    }

    fn addresses(&self, link: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
        Ok(bound_ipv4s_in_current_ns()?
            .into_iter()
            .filter(|b| b.label == link)
            .map(|b| b.ip)
            .collect())
    }

    fn create_veth_into_netns(
        &self,
        host_name: &str,
        container_name: &str,
        mtu: u32,
        netns_path: &Path,
    ) -> anyhow::Result<VethPair> {
        // Create in the host namespace, then move the container end.
        let mut link = LinkMessage::default();
        link.attributes.push(LinkAttribute::IfName(host_name.to_string()));
        link.attributes.push(LinkAttribute::Mtu(mtu));
        self.request_ack(RouteNetlinkMessage::NewLink(link), NLM_F_CREATE | NLM_F_EXCL)?;

        let netns_file = File::open(netns_path)?;
        let mut peer = LinkMessage::default();
        peer.attributes.push(LinkAttribute::IfName(container_name.to_string()));
        peer.attributes
            .push(LinkAttribute::NetNsFd(netns_file.as_raw_fd()));
        self.request_ack(RouteNetlinkMessage::NewLink(peer), NLM_F_CREATE)?;

        Ok(VethPair {
            host_name: host_name.to_string(),
            host_mac: String::new(),
            container_name: container_name.to_string(),
            container_mac: String::new(),
        })
    }

    fn veth_peer_index(&self, netns_path: &Path, container_name: &str) -> anyhow::Result<i32> {
        let mut index = -1;
        self.run_in_netns(netns_path, &mut || {
            index = read_sysfs_iflink(container_name)?;
            Ok(())
        })?;
        Ok(index)
    }

    fn link_name_by_index(&self, index: i32) -> anyhow::Result<String> {
        for entry in std::fs::read_dir("/sys/class/net")?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if read_sysfs_ifindex(&name).unwrap_or(-1) == index {
                return Ok(name);
            }
        }
        anyhow::bail!("no link with ifindex {index}")
    }

    fn add_scope_link_route(&self, link: &str, dst: Ipv4Addr) -> anyhow::Result<()> {
        let mut route = RouteMessage::default();
        route.header.scope = RouteScope::Link;
        route.attributes.push(RouteAttribute::Destination(dst.into()));
        route.header.destination_prefix_length = 32;
        route.attributes.push(RouteAttribute::Oif(link_index(link)?));
        self.request_ack(RouteNetlinkMessage::NewRoute(route), NLM_F_CREATE)
    }

    fn add_default_route(&self, link: &str, gateway: Ipv4Addr) -> anyhow::Result<()> {
        let mut route = RouteMessage::default();
        route.attributes.push(RouteAttribute::Gateway(gateway.into()));
        route.attributes.push(RouteAttribute::Oif(link_index(link)?));
        self.request_ack(RouteNetlinkMessage::NewRoute(route), NLM_F_CREATE)
    }

    fn add_table_route(&self, link: &str, dst: Ipv4Network, gateway: Ipv4Addr, table: u32) -> anyhow::Result<()> {
        let mut route = RouteMessage::default();
        route.attributes.push(RouteAttribute::Destination(dst.ip().into()));
        route.header.destination_prefix_length = dst.prefix();
        route.attributes.push(RouteAttribute::Gateway(gateway.into()));
        route.attributes.push(RouteAttribute::Oif(link_index(link)?));
        route.attributes.push(RouteAttribute::Table(table));
        self.request_ack(RouteNetlinkMessage::NewRoute(route), NLM_F_CREATE | NLM_F_EXCL)
    }

    fn rule_tables_in_use(&self) -> anyhow::Result<Vec<u32>> {
        let mut set: HashSet<u32> = HashSet::new();
        for family in [libc::AF_INET as u8, libc::AF_INET6 as u8] {
            for rule in self.dump_rules(family)? {
                for attr in &rule.attributes {
                    if let RuleAttribute::Table(t) = attr {
                        set.insert(*t);
                    }
                }
            }
        }
        Ok(set.into_iter().collect())
    }

    fn add_iif_rule(&self, iif: &str, table: u32, priority: u32) -> anyhow::Result<()> {
        let mut rule = RuleMessage::default();
        rule.attributes.push(RuleAttribute::Iifname(iif.to_string()));
        rule.attributes.push(RuleAttribute::Table(table));
        rule.attributes.push(RuleAttribute::Priority(priority));
        self.request_ack(RouteNetlinkMessage::NewRule(rule), NLM_F_CREATE)
    }

    fn del_iif_rule(&self, iif: &str) -> anyhow::Result<()> {
        let mut rule = RuleMessage::default();
        rule.attributes.push(RuleAttribute::Iifname(iif.to_string()));
        self.request_ack(RouteNetlinkMessage::DelRule(rule), 0)
    }

    fn fwmark_rule_exists(&self, mark: u32, table: u32, priority: u32) -> anyhow::Result<bool> {
        for rule in self.dump_rules(libc::AF_INET as u8)? {
            let mut has_mark = false;
            let mut has_table = false;
            let mut has_prio = false;
            for attr in &rule.attributes {
                match attr {
                    RuleAttribute::FwMark(m) if *m == mark => has_mark = true,
                    RuleAttribute::Table(t) if *t == table => has_table = true,
                    RuleAttribute::Priority(p) if *p == priority => has_prio = true,
                    _ => {}
                }
            }
            if has_mark && has_table && has_prio {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn add_fwmark_rule(&self, mark: u32, table: u32, priority: u32) -> anyhow::Result<()> {
        let mut rule = RuleMessage::default();
        rule.attributes.push(RuleAttribute::FwMark(mark));
        rule.attributes.push(RuleAttribute::Table(table));
        rule.attributes.push(RuleAttribute::Priority(priority));
        self.request_ack(RouteNetlinkMessage::NewRule(rule), NLM_F_CREATE)
    }

    fn run_in_netns(&self, netns_path: &Path, f: &mut dyn FnMut() -> anyhow::Result<()>) -> anyhow::Result<()> {
        assert_single_thread_or_panic();
        let current = File::open("/proc/self/ns/net")?;
        let target = File::open(netns_path)?;
        setns(&target)?;
        let result = f();
        // Always restore, even if f() failed.
        let restore = setns(&current);
        result.and(restore)
    }

    fn gratuitous_arp(&self, link: &str, ip: Ipv4Addr) -> anyhow::Result<()> {
        send_gratuitous_arp(link, ip)
    }

    fn set_rp_filter_loose(&self, link: &str) -> anyhow::Result<()> {
        std::fs::write(format!("/proc/sys/net/ipv4/conf/{link}/rp_filter"), b"2\n")?;
        Ok(())
    }
}

fn assert_single_thread_or_panic() {
    super::assert_single_threaded();
}

fn setns(file: &File) -> anyhow::Result<()> {
    let rc = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc == -1 {
        anyhow::bail!("setns failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn link_index(name: &str) -> anyhow::Result<u32> {
    read_sysfs_ifindex(name).map(|i| i as u32)
}

fn read_sysfs_ifindex(name: &str) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/ifindex"))?;
    Ok(raw.trim().parse()?)
}

fn read_sysfs_iflink(name: &str) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/iflink"))?;
    Ok(raw.trim().parse()?)
}

fn bound_ipv4s_in_current_ns() -> anyhow::Result<Vec<BoundAddr>> {
    // Synchronous AddrDump via the same socket/request machinery as the
    // route/rule helpers above, parsed into (ip, link-name) pairs.
    let ops = NetlinkOps::new();
    let socket = ops.socket()?;
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    let mut addr = AddressMessage::default();
    addr.header.family = netlink_packet_route::AddressFamily::Inet;
    let mut msg = NetlinkMessage::from(RouteNetlinkMessage::GetAddress(addr));
    msg.header.flags = NLM_F_REQUEST | netlink_packet_core::NLM_F_DUMP;
    msg.finalize();
    let mut buf = vec![0u8; msg.buffer_len()];
    msg.serialize(&mut buf);
    socket.send(&buf, 0)?;

    let mut results = Vec::new();
    let mut recv_buf = vec![0u8; 65536];
    'outer: loop {
        let (n, _) = socket.recv_from(&mut recv_buf, 0)?;
        let mut offset = 0;
        while offset < n {
            let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..n])?;
            let len = reply.header.length as usize;
            match reply.payload {
                NetlinkPayload::Done(_) => break 'outer,
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(a)) => {
                    let mut ip = None;
                    for attr in &a.attributes {
                        if let AddressAttribute::Address(std::net::IpAddr::V4(v4)) = attr {
                            ip = Some(*v4);
                        }
                    }
                    if let Some(ip) = ip {
                        let label = ops.link_name_by_index(a.header.index as i32).unwrap_or_default();
                        results.push(BoundAddr { ip, label });
                    }
                }
                _ => {}
            }
            if len == 0 {
                break;
            }
            offset += len;
        }
    }
    Ok(results)
}

/// Sends a single gratuitous ARP request (sender == target address) out
/// `link` over a raw Ethernet channel, announcing `ip` to the local
/// broadcast domain. Mirrors the original's fire-and-forget
/// `arping.GratuitousArpOverIface`; callers treat the result as best-effort.
fn send_gratuitous_arp(link: &str, ip: Ipv4Addr) -> anyhow::Result<()> {
    let iface = pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == link)
        .ok_or_else(|| anyhow::anyhow!("no such interface: {link}"))?;
    let mac = iface
        .mac
        .ok_or_else(|| anyhow::anyhow!("{link} has no hardware address"))?;

    let mut tx = match pnet_datalink::channel(&iface, pnet_datalink::Config::default())? {
        Channel::Ethernet(tx, _rx) => tx,
        _ => anyhow::bail!("unsupported datalink channel type for {link}"),
    };

    let frame = gratuitous_arp_frame(mac, ip);
    tx.send_to(&frame, None)
        .ok_or_else(|| anyhow::anyhow!("send_to produced no result for {link}"))??;
    Ok(())
}

/// Raw Ethernet+ARP bytes for a gratuitous announce: broadcast destination,
/// opcode REQUEST, sender protocol address equal to target protocol address.
fn gratuitous_arp_frame(mac: MacAddr, ip: Ipv4Addr) -> Vec<u8> {
    let mac = [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5];
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&[0xff; 6]); // dst: broadcast
    frame.extend_from_slice(&mac); // src
    frame.extend_from_slice(&0x0806u16.to_be_bytes()); // ethertype: ARP

    frame.extend_from_slice(&0x0001u16.to_be_bytes()); // htype: ethernet
    frame.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype: ipv4
    frame.push(6); // hlen
    frame.push(4); // plen
    frame.extend_from_slice(&0x0001u16.to_be_bytes()); // opcode: request
    frame.extend_from_slice(&mac); // sender hw addr
    frame.extend_from_slice(&ip.octets()); // sender proto addr
    frame.extend_from_slice(&[0x00; 6]); // target hw addr: unknown
    frame.extend_from_slice(&ip.octets()); // target proto addr == sender, gratuitous
    frame
}

fn ioctl_get_mtu(name: &str) -> anyhow::Result<u32> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))?;
    Ok(raw.trim().parse()?)
}

fn ioctl_set_mtu(name: &str, mtu: u32) -> anyhow::Result<()> {
    std::fs::write(format!("/sys/class/net/{name}/mtu"), format!("{mtu}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gratuitous_arp_frame_is_sender_eq_target() {
        let mac = MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let frame = gratuitous_arp_frame(mac, ip);

        assert_eq!(frame.len(), 42);
        assert_eq!(&frame[0..6], &[0xff; 6]); // broadcast destination
        assert_eq!(&frame[12..14], &0x0806u16.to_be_bytes()); // ARP ethertype
        assert_eq!(&frame[20..22], &0x0001u16.to_be_bytes()); // opcode: request
        let sender_proto = &frame[28..32];
        let target_proto = &frame[38..42];
        assert_eq!(sender_proto, target_proto);
        assert_eq!(sender_proto, &ip.octets());
    }
}
