//! Instance metadata tree: VNIs (device-number, MAC, IPs, subnet, VPC
//! CIDRs, security groups) parsed from the cloud's per-instance metadata
//! service into a typed, sorted view.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// A cloud-attached virtual network interface and everything the allocator
/// and datapath need to know about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vni {
    pub id: String,
    pub mac: String,
    pub device_index: u32,
    pub ipv4s: Vec<Ipv4Addr>,
    pub subnet_id: String,
    pub subnet_cidr: Ipv4Network,
    pub vpc_id: String,
    pub vpc_primary_cidr: Ipv4Network,
    pub vpc_cidrs: Vec<Ipv4Network>,
    pub security_group_ids: Vec<String>,
}

impl Vni {
    /// `ethN` local link name, matching the convention the allocator's
    /// settle-poll and the datapath's master-interface lookup both expect.
    pub fn local_name(&self) -> String {
        format!("eth{}", self.device_index)
    }

    pub fn primary_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4s.first().copied()
    }
}

/// Abstraction over the instance metadata HTTP source; the real
/// implementation fetches from the cloud's link-local metadata endpoint,
/// tests substitute an in-memory fake.
pub trait MetadataSource: Send + Sync {
    fn available(&self) -> bool;
    fn instance_type(&self) -> anyhow::Result<String>;
    fn availability_zone(&self) -> anyhow::Result<String>;
    fn instance_id(&self) -> anyhow::Result<String>;
    fn interfaces(&self) -> anyhow::Result<Vec<Vni>>;
}

/// Link-local HTTP metadata source. Fetches the MAC list under
/// `network/interfaces/macs/` and, per MAC, the attributes the allocator and
/// datapath need. Host ifname is resolved separately, by matching MAC
/// address against the host's actual links via `pnet_datalink`.
pub struct HttpMetadataSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpMetadataSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpMetadataSource {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn get(&self, path: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()?
            .error_for_status()?;
        Ok(resp.text()?)
    }

    fn lines(&self, path: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .get(path)?
            .lines()
            .map(|l| l.trim_end_matches('/').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    fn fetch_vni(&self, mac: &str, device_index: u32) -> anyhow::Result<Vni> {
        let base = format!("network/interfaces/macs/{mac}/");
        let id = self.get(&format!("{base}interface-id"))?;
        let ipv4s = self
            .lines(&format!("{base}local-ipv4s"))?
            .into_iter()
            .filter_map(|s| s.parse::<Ipv4Addr>().ok())
            .collect();
        let subnet_id = self.get(&format!("{base}subnet-id"))?;
        let subnet_cidr: Ipv4Network = self.get(&format!("{base}subnet-ipv4-cidr-block"))?.parse()?;
        let vpc_id = self.get(&format!("{base}vpc-id"))?;
        let vpc_primary_cidr: Ipv4Network = self.get(&format!("{base}vpc-ipv4-cidr-block"))?.parse()?;
        let vpc_cidrs = self
            .lines(&format!("{base}vpc-ipv4-cidr-blocks"))?
            .into_iter()
            .filter_map(|s| s.parse::<Ipv4Network>().ok())
            .collect();
        let security_group_ids = self.lines(&format!("{base}security-group-ids"))?;

        Ok(Vni {
            id,
            mac: mac.to_string(),
            device_index,
            ipv4s,
            subnet_id,
            subnet_cidr,
            vpc_id,
            vpc_primary_cidr,
            vpc_cidrs,
            security_group_ids,
        })
    }
}

impl MetadataSource for HttpMetadataSource {
    fn available(&self) -> bool {
        self.get("instance-id").is_ok()
    }

    fn instance_type(&self) -> anyhow::Result<String> {
        self.get("instance-type")
    }

    fn availability_zone(&self) -> anyhow::Result<String> {
        self.get("placement/availability-zone")
    }

    fn instance_id(&self) -> anyhow::Result<String> {
        self.get("instance-id")
    }

    fn interfaces(&self) -> anyhow::Result<Vec<Vni>> {
        let macs = self.lines("network/interfaces/macs/")?;
        let mut vnis = Vec::with_capacity(macs.len());
        for (index, mac) in macs.iter().enumerate() {
            let device_index = self
                .get(&format!("network/interfaces/macs/{mac}/device-number"))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(index as u32);
            vnis.push(self.fetch_vni(mac, device_index)?);
        }
        Ok(sort_by_device_index(vnis))
    }
}

/// Resolves a VNI's host-side link name by matching its MAC address against
/// the host's actual interfaces, falling back to the device-index
/// convention (`ethN`) when no match is found (e.g. the link has not
/// appeared in the kernel yet).
pub fn resolve_local_name(vni: &Vni) -> String {
    let wanted = vni.mac.to_ascii_lowercase();
    for iface in pnet_datalink::interfaces() {
        if let Some(mac) = iface.mac {
            if mac.to_string().to_ascii_lowercase() == wanted {
                return iface.name;
            }
        }
    }
    vni.local_name()
}

/// Parses the newline-separated MAC list and per-MAC attribute fetches
/// that the real metadata source performs into a sorted `Vec<Vni>`. Kept
/// as a free function so both the HTTP-backed source and any fixture
/// loader (e.g. from a flat JSON blob in tests) can share it.
pub fn sort_by_device_index(mut vnis: Vec<Vni>) -> Vec<Vni> {
    vnis.sort_by_key(|v| v.device_index);
    vnis
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeMetadata {
        pub vnis: Mutex<Vec<Vni>>,
        pub instance_type: String,
        pub az: String,
    }

    impl FakeMetadata {
        pub fn new(vnis: Vec<Vni>) -> Self {
            FakeMetadata {
                vnis: Mutex::new(vnis),
                instance_type: "m5.large".to_string(),
                az: "us-east-1a".to_string(),
            }
        }
    }

    impl MetadataSource for FakeMetadata {
        fn available(&self) -> bool {
            true
        }
        fn instance_type(&self) -> anyhow::Result<String> {
            Ok(self.instance_type.clone())
        }
        fn availability_zone(&self) -> anyhow::Result<String> {
            Ok(self.az.clone())
        }
        fn instance_id(&self) -> anyhow::Result<String> {
            Ok("i-fake".to_string())
        }
        fn interfaces(&self) -> anyhow::Result<Vec<Vni>> {
            Ok(sort_by_device_index(self.vnis.lock().unwrap().clone()))
        }
    }
}
