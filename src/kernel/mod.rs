//! `KernelOps`: the netlink/netns boundary. One capability trait covering
//! link, address, route, and rule manipulation plus network-namespace
//! entry, so the allocator and datapath builder can run against an
//! in-memory fake in tests and a real synchronous netlink transport in
//! production.
//!
//! All of this must run pinned to a single OS thread — netns state is
//! thread-local to the kernel, not process-local. `assert_single_threaded`
//! is a cheap guard callers invoke before any netns-entering operation.

pub mod iptables;
pub mod netlink;

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnetwork::Ipv4Network;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAddr {
    pub ip: Ipv4Addr,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct VethPair {
    pub host_name: String,
    pub host_mac: String,
    pub container_name: String,
    pub container_mac: String,
}

pub trait KernelOps: Send + Sync {
    /// Every IPv4 currently bound on any link, in the root namespace plus
    /// every namespace under `/var/run/netns`.
    fn bound_ipv4s(&self) -> anyhow::Result<Vec<BoundAddr>>;

    fn link_up(&self, name: &str) -> anyhow::Result<()>;
    fn link_up_poll(&self, name: &str, timeout: Duration) -> anyhow::Result<()>;
    fn get_mtu(&self, name: &str) -> anyhow::Result<u32>;
    fn set_mtu(&self, name: &str, mtu: u32) -> anyhow::Result<()>;
    fn link_delete(&self, name: &str) -> anyhow::Result<()>;
    fn addresses(&self, link: &str) -> anyhow::Result<Vec<Ipv4Addr>>;

    /// Creates a veth pair inside `netns_path`, keeping `host_name` in the
    /// current (host) namespace and moving the peer in.
    fn create_veth_into_netns(
        &self,
        host_name: &str,
        container_name: &str,
        mtu: u32,
        netns_path: &Path,
    ) -> anyhow::Result<VethPair>;

    /// The host-side ifindex for the veth peer of `container_name`,
    /// looked up from inside the container's namespace. Survives the
    /// namespace move because ifindex is assigned at creation time.
    fn veth_peer_index(&self, netns_path: &Path, container_name: &str) -> anyhow::Result<i32>;
    fn link_name_by_index(&self, index: i32) -> anyhow::Result<String>;

    fn add_scope_link_route(&self, link: &str, dst: Ipv4Addr) -> anyhow::Result<()>;
    fn add_default_route(&self, link: &str, gateway: Ipv4Addr) -> anyhow::Result<()>;
    fn add_table_route(&self, link: &str, dst: Ipv4Network, gateway: Ipv4Addr, table: u32) -> anyhow::Result<()>;

    fn rule_tables_in_use(&self) -> anyhow::Result<Vec<u32>>;
    fn add_iif_rule(&self, iif: &str, table: u32, priority: u32) -> anyhow::Result<()>;
    fn del_iif_rule(&self, iif: &str) -> anyhow::Result<()>;
    fn fwmark_rule_exists(&self, mark: u32, table: u32, priority: u32) -> anyhow::Result<bool>;
    fn add_fwmark_rule(&self, mark: u32, table: u32, priority: u32) -> anyhow::Result<()>;

    fn run_in_netns(&self, netns_path: &Path, f: &mut dyn FnMut() -> anyhow::Result<()>) -> anyhow::Result<()>;
    fn gratuitous_arp(&self, link: &str, ip: Ipv4Addr) -> anyhow::Result<()>;
    fn set_rp_filter_loose(&self, link: &str) -> anyhow::Result<()>;
}

/// Asserts the calling OS thread is the process's only thread. The kernel
/// assigns the main thread's tid equal to the pid; any other thread's tid
/// differs, so this catches a stray spawned thread entering a netns-mutating
/// call. Runs in release builds too, since the invariant it guards is a
/// safety boundary, not a debugging aid.
pub fn assert_single_threaded() {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let pid = std::process::id() as i64;
    assert!(
        tid == pid,
        "namespace operations require the process to stay on its single starting thread (tid {tid} != pid {pid})"
    );
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeKernel {
        pub bound: Mutex<Vec<BoundAddr>>,
        pub links: Mutex<HashMap<String, u32>>, // name -> mtu
        pub tables_in_use: Mutex<HashSet<u32>>,
        pub iif_rules: Mutex<HashMap<String, u32>>, // iif -> table
        pub table_routes: Mutex<Vec<(String, Ipv4Network, Ipv4Addr, u32)>>,
        pub fwmark_rules: Mutex<HashSet<(u32, u32, u32)>>,
        pub next_peer_index: Mutex<i32>,
        pub index_to_name: Mutex<HashMap<i32, String>>,
        pub deleted_links: Mutex<HashSet<String>>,
    }

    impl FakeKernel {
        pub fn new() -> Self {
            FakeKernel {
                next_peer_index: Mutex::new(100),
                ..Default::default()
            }
        }
    }

    impl KernelOps for FakeKernel {
        fn bound_ipv4s(&self) -> anyhow::Result<Vec<BoundAddr>> {
            Ok(self.bound.lock().unwrap().clone())
        }
        fn link_up(&self, name: &str) -> anyhow::Result<()> {
            self.links.lock().unwrap().entry(name.to_string()).or_insert(1500);
            Ok(())
        }
        fn link_up_poll(&self, name: &str, _timeout: Duration) -> anyhow::Result<()> {
            self.link_up(name)
        }
        fn get_mtu(&self, name: &str) -> anyhow::Result<u32> {
            Ok(*self.links.lock().unwrap().get(name).unwrap_or(&1500))
        }
        fn set_mtu(&self, name: &str, mtu: u32) -> anyhow::Result<()> {
            self.links.lock().unwrap().insert(name.to_string(), mtu);
            Ok(())
        }
        fn link_delete(&self, name: &str) -> anyhow::Result<()> {
            self.deleted_links.lock().unwrap().insert(name.to_string());
            self.iif_rules.lock().unwrap().remove(name);
            Ok(())
        }
        fn addresses(&self, link: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
            Ok(self
                .bound
                .lock()
                .unwrap()
                .iter()
                .filter(|b| b.label == link)
                .map(|b| b.ip)
                .collect())
        }
        fn create_veth_into_netns(
            &self,
            host_name: &str,
            container_name: &str,
            _mtu: u32,
            _netns_path: &Path,
        ) -> anyhow::Result<VethPair> {
            let mut idx = self.next_peer_index.lock().unwrap();
            *idx += 1;
            self.index_to_name.lock().unwrap().insert(*idx, host_name.to_string());
            Ok(VethPair {
                host_name: host_name.to_string(),
                host_mac: "aa:bb:cc:00:00:01".to_string(),
                container_name: container_name.to_string(),
                container_mac: "aa:bb:cc:00:00:02".to_string(),
            })
        }
        fn veth_peer_index(&self, _netns_path: &Path, _container_name: &str) -> anyhow::Result<i32> {
            Ok(*self.next_peer_index.lock().unwrap())
        }
        fn link_name_by_index(&self, index: i32) -> anyhow::Result<String> {
            self.index_to_name
                .lock()
                .unwrap()
                .get(&index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such ifindex"))
        }
        fn add_scope_link_route(&self, _link: &str, _dst: Ipv4Addr) -> anyhow::Result<()> {
            Ok(())
        }
        fn add_default_route(&self, _link: &str, _gateway: Ipv4Addr) -> anyhow::Result<()> {
            Ok(())
        }
        fn add_table_route(&self, link: &str, dst: Ipv4Network, gateway: Ipv4Addr, table: u32) -> anyhow::Result<()> {
            self.table_routes
                .lock()
                .unwrap()
                .push((link.to_string(), dst, gateway, table));
            self.tables_in_use.lock().unwrap().insert(table);
            Ok(())
        }
        fn rule_tables_in_use(&self) -> anyhow::Result<Vec<u32>> {
            Ok(self.tables_in_use.lock().unwrap().iter().copied().collect())
        }
        fn add_iif_rule(&self, iif: &str, table: u32, _priority: u32) -> anyhow::Result<()> {
            self.iif_rules.lock().unwrap().insert(iif.to_string(), table);
            Ok(())
        }
        fn del_iif_rule(&self, iif: &str) -> anyhow::Result<()> {
            self.iif_rules.lock().unwrap().remove(iif);
            Ok(())
        }
        fn fwmark_rule_exists(&self, mark: u32, table: u32, priority: u32) -> anyhow::Result<bool> {
            Ok(self.fwmark_rules.lock().unwrap().contains(&(mark, table, priority)))
        }
        fn add_fwmark_rule(&self, mark: u32, table: u32, priority: u32) -> anyhow::Result<()> {
            self.fwmark_rules.lock().unwrap().insert((mark, table, priority));
            Ok(())
        }
        fn run_in_netns(&self, _netns_path: &Path, f: &mut dyn FnMut() -> anyhow::Result<()>) -> anyhow::Result<()> {
            f()
        }
        fn gratuitous_arp(&self, _link: &str, _ip: Ipv4Addr) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_rp_filter_loose(&self, _link: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
