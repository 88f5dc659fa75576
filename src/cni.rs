//! CNI stdin/stdout JSON shapes shared by both plugin binaries, and the
//! ADD/DEL/CHECK/VERSION dispatch that wraps their entry points.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

fn default_reuse_ip_wait() -> u64 {
    60
}
fn default_table_start() -> u32 {
    256
}
fn default_node_port_mark() -> u32 {
    0x2000
}
fn default_node_ports() -> String {
    "30000:32767".to_string()
}

/// Config consumed by the IPAM-chain binary.
#[derive(Debug, Clone, Deserialize)]
pub struct IpamConfig {
    pub name: String,
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "secGroupIds")]
    pub sec_group_ids: Vec<String>,
    #[serde(rename = "subnetTags", default)]
    pub subnet_tags: HashMap<String, String>,
    #[serde(rename = "interfaceIndex", default)]
    pub interface_index: u32,
    #[serde(rename = "skipDeallocation", default)]
    pub skip_deallocation: bool,
    #[serde(rename = "routeToVpcPeers", default)]
    pub route_to_vpc_peers: bool,
    #[serde(rename = "reuseIPWait", default = "default_reuse_ip_wait")]
    pub reuse_ip_wait: u64,
}

/// Config consumed by the unnumbered-PTP datapath binary. Carries the
/// previous plugin's result (the IPAM chain's output) as a generic JSON
/// value, parsed lazily into `CniResult` once the CNI version is known.
#[derive(Debug, Clone, Deserialize)]
pub struct PtpConfig {
    pub name: String,
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<serde_json::Value>,
    #[serde(rename = "ipMasq", default)]
    pub ip_masq: bool,
    #[serde(rename = "hostInterface")]
    pub host_interface: String,
    #[serde(rename = "containerInterface")]
    pub container_interface: String,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(rename = "routeTableStart", default = "default_table_start")]
    pub route_table_start: u32,
    #[serde(rename = "nodePortMark", default = "default_node_port_mark")]
    pub node_port_mark: u32,
    #[serde(rename = "nodePorts", default = "default_node_ports")]
    pub node_ports: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniIpConfig {
    pub version: String,
    pub address: Ipv4Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: Ipv4Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CniDns {
    #[serde(default)]
    pub nameservers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CniResult {
    #[serde(rename = "cniVersion", skip_serializing_if = "Option::is_none")]
    pub cni_version: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<CniIpConfig>,
    #[serde(default)]
    pub routes: Vec<CniRoute>,
    #[serde(default)]
    pub dns: CniDns,
}

/// The subset of the CNI runtime environment both binaries read.
#[derive(Debug, Clone)]
pub struct CniArgs {
    pub command: String,
    pub container_id: String,
    pub netns: Option<PathBuf>,
    pub ifname: String,
}

impl CniArgs {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(CniArgs {
            command: std::env::var("CNI_COMMAND")?,
            container_id: std::env::var("CNI_CONTAINERID").unwrap_or_default(),
            netns: std::env::var("CNI_NETNS").ok().map(PathBuf::from),
            ifname: std::env::var("CNI_IFNAME").unwrap_or_default(),
        })
    }
}

pub fn read_stdin() -> anyhow::Result<Vec<u8>> {
    use std::io::Read;
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn print_result(result: &CniResult) -> anyhow::Result<()> {
    serde_json::to_writer(std::io::stdout(), result)?;
    Ok(())
}
