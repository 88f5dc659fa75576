//! The cloud control-plane boundary: one capability trait covering every
//! mutating and descriptive call the allocator and datapath need, rather
//! than the several interface-typed sub-clients the original composes —
//! a single Rust trait already gives callers the same in-memory fakes
//! without the interface-embedding idiom.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::limits::Limits;
use crate::metadata::Vni;
use crate::subnets::Subnet;

pub trait CloudApi: Send + Sync {
    fn assign_secondary_ips(&self, vni_id: &str, count: u32) -> anyhow::Result<()>;
    fn unassign_ip(&self, vni_id: &str, ip: Ipv4Addr) -> anyhow::Result<()>;

    fn create_network_interface(
        &self,
        subnet_id: &str,
        security_groups: &[String],
        secondary_count: u32,
        description: &str,
    ) -> anyhow::Result<String>;
    fn attach_network_interface(&self, vni_id: &str, device_index: u32) -> anyhow::Result<String>;
    fn modify_delete_on_termination(&self, vni_id: &str, attachment_id: &str) -> anyhow::Result<()>;
    fn detach_network_interface(&self, attachment_id: &str) -> anyhow::Result<()>;
    fn delete_network_interface(&self, vni_id: &str) -> anyhow::Result<()>;
    fn describe_network_interface_status(&self, vni_id: &str) -> anyhow::Result<(String, String)>; // (status, attachment_id)

    fn subnets_for_instance(&self, availability_zone: &str) -> anyhow::Result<Vec<Subnet>>;
    fn describe_instance_type_limits(&self, instance_type: &str) -> anyhow::Result<Limits>;
    fn describe_vpc_cidrs(&self, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>>;
    fn describe_vpc_peer_cidrs(&self, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>>;
}

/// HTTP-backed implementation. Kept intentionally thin: the exact vendor
/// SDK request/response shapes are a collaborator concern per SPEC_FULL.md
/// §9, not load-bearing for the allocator/datapath properties tested
/// against `fake::FakeCloud` below. Uses the teacher's blocking `reqwest`
/// client rather than an async SDK, matching the single-thread constraint.
pub struct HttpCloudApi {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpCloudApi {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpCloudApi {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(body)
            .send()?
            .error_for_status()?;
        Ok(resp.json()?)
    }
}

impl CloudApi for HttpCloudApi {
    fn assign_secondary_ips(&self, vni_id: &str, count: u32) -> anyhow::Result<()> {
        self.post(
            "/AssignPrivateIpAddresses",
            &serde_json::json!({"NetworkInterfaceId": vni_id, "SecondaryPrivateIpAddressCount": count}),
        )?;
        Ok(())
    }

    fn unassign_ip(&self, vni_id: &str, ip: Ipv4Addr) -> anyhow::Result<()> {
        self.post(
            "/UnassignPrivateIpAddresses",
            &serde_json::json!({"NetworkInterfaceId": vni_id, "PrivateIpAddresses": [ip.to_string()]}),
        )?;
        Ok(())
    }

    fn create_network_interface(
        &self,
        subnet_id: &str,
        security_groups: &[String],
        secondary_count: u32,
        description: &str,
    ) -> anyhow::Result<String> {
        let resp = self.post(
            "/CreateNetworkInterface",
            &serde_json::json!({
                "SubnetId": subnet_id,
                "Groups": security_groups,
                "SecondaryPrivateIpAddressCount": secondary_count,
                "Description": description,
            }),
        )?;
        Ok(resp["NetworkInterface"]["NetworkInterfaceId"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    fn attach_network_interface(&self, vni_id: &str, device_index: u32) -> anyhow::Result<String> {
        let resp = self.post(
            "/AttachNetworkInterface",
            &serde_json::json!({"NetworkInterfaceId": vni_id, "DeviceIndex": device_index}),
        )?;
        Ok(resp["AttachmentId"].as_str().unwrap_or_default().to_string())
    }

    fn modify_delete_on_termination(&self, vni_id: &str, attachment_id: &str) -> anyhow::Result<()> {
        self.post(
            "/ModifyNetworkInterfaceAttribute",
            &serde_json::json!({
                "NetworkInterfaceId": vni_id,
                "Attachment": {"AttachmentId": attachment_id, "DeleteOnTermination": true},
            }),
        )?;
        Ok(())
    }

    fn detach_network_interface(&self, attachment_id: &str) -> anyhow::Result<()> {
        self.post(
            "/DetachNetworkInterface",
            &serde_json::json!({"AttachmentId": attachment_id, "Force": false}),
        )?;
        Ok(())
    }

    fn delete_network_interface(&self, vni_id: &str) -> anyhow::Result<()> {
        self.post(
            "/DeleteNetworkInterface",
            &serde_json::json!({"NetworkInterfaceId": vni_id}),
        )?;
        Ok(())
    }

    fn describe_network_interface_status(&self, vni_id: &str) -> anyhow::Result<(String, String)> {
        let resp = self.post(
            "/DescribeNetworkInterfaces",
            &serde_json::json!({"NetworkInterfaceIds": [vni_id]}),
        )?;
        let iface = &resp["NetworkInterfaces"][0];
        Ok((
            iface["Status"].as_str().unwrap_or_default().to_string(),
            iface["Attachment"]["AttachmentId"].as_str().unwrap_or_default().to_string(),
        ))
    }

    fn subnets_for_instance(&self, availability_zone: &str) -> anyhow::Result<Vec<Subnet>> {
        let resp = self.post(
            "/DescribeSubnets",
            &serde_json::json!({"Filters": [{"Name": "availabilityZone", "Values": [availability_zone]}]}),
        )?;
        Ok(serde_json::from_value(resp["Subnets"].clone())?)
    }

    fn describe_instance_type_limits(&self, instance_type: &str) -> anyhow::Result<Limits> {
        let resp = self.post(
            "/DescribeInstanceTypes",
            &serde_json::json!({"InstanceTypes": [instance_type]}),
        )?;
        let info = &resp["InstanceTypes"][0]["NetworkInfo"];
        Ok(Limits {
            adapters: info["MaximumNetworkInterfaces"].as_u64().unwrap_or(4) as u32,
            ipv4: info["Ipv4AddressesPerInterface"].as_u64().unwrap_or(15) as u32,
            ipv6: info["Ipv6AddressesPerInterface"].as_u64().unwrap_or(15) as u32,
        })
    }

    fn describe_vpc_cidrs(&self, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>> {
        let resp = self.post("/DescribeVpcs", &serde_json::json!({"VpcIds": [vpc_id]}))?;
        let mut cidrs = Vec::new();
        if let Some(assocs) = resp["Vpcs"][0]["CidrBlockAssociationSet"].as_array() {
            for a in assocs {
                if let Some(cidr) = a["CidrBlock"].as_str() {
                    cidrs.push(cidr.parse()?);
                }
            }
        }
        Ok(cidrs)
    }

    fn describe_vpc_peer_cidrs(&self, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>> {
        // Derived from route-table entries whose target is a peering
        // connection: anything that is not the default route and not
        // targeting an internet gateway, per the route-table-derived
        // discovery this replaces.
        let resp = self.post(
            "/DescribeRouteTables",
            &serde_json::json!({"Filters": [{"Name": "vpc-id", "Values": [vpc_id]}]}),
        )?;
        let mut cidrs = Vec::new();
        if let Some(tables) = resp["RouteTables"].as_array() {
            for table in tables {
                if let Some(routes) = table["Routes"].as_array() {
                    for route in routes {
                        if route.get("EgressOnlyInternetGatewayId").is_some() {
                            continue;
                        }
                        if route["GatewayId"].as_str().map(|g| g.starts_with("igw-")).unwrap_or(false) {
                            continue;
                        }
                        if let Some(cidr) = route["DestinationCidrBlock"].as_str() {
                            if let Ok(net) = cidr.parse::<Ipv4Network>() {
                                if !net.ip().is_unspecified() {
                                    cidrs.push(net);
                                }
                            }
                        }
                    }
                }
            }
        }
        cidrs.sort_by_key(|c| c.to_string());
        cidrs.dedup();
        Ok(cidrs)
    }
}

/// Returns true for instance families with the known metadata bug that
/// drops secondary VPC CIDRs from the metadata tree (c5/m5 at time of
/// writing); callers fall back to `describe_vpc_cidrs` for those.
pub fn has_bug_broken_vpc_cidrs(instance_type: &str) -> bool {
    matches!(instance_type.split('.').next(), Some("c5") | Some("m5"))
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct FakeCloud {
        pub limits: Limits,
        pub subnets: Vec<Subnet>,
        pub vpc_cidrs: HashMap<String, Vec<Ipv4Network>>,
        pub vpc_peer_cidrs: HashMap<String, Vec<Ipv4Network>>,
        pub assigned: Mutex<HashMap<String, u32>>,
        pub next_vni_id: Mutex<u32>,
        pub created: Mutex<Vec<String>>,
    }

    impl FakeCloud {
        pub fn new() -> Self {
            FakeCloud {
                limits: super::FALLBACK_FOR_TESTS,
                subnets: Vec::new(),
                vpc_cidrs: HashMap::new(),
                vpc_peer_cidrs: HashMap::new(),
                assigned: Mutex::new(HashMap::new()),
                next_vni_id: Mutex::new(100),
                created: Mutex::new(Vec::new()),
            }
        }
    }

    impl CloudApi for FakeCloud {
        fn assign_secondary_ips(&self, vni_id: &str, count: u32) -> anyhow::Result<()> {
            *self.assigned.lock().unwrap().entry(vni_id.to_string()).or_insert(0) += count;
            Ok(())
        }
        fn unassign_ip(&self, _vni_id: &str, _ip: Ipv4Addr) -> anyhow::Result<()> {
            Ok(())
        }
        fn create_network_interface(
            &self,
            _subnet_id: &str,
            _security_groups: &[String],
            _secondary_count: u32,
            _description: &str,
        ) -> anyhow::Result<String> {
            let mut id = self.next_vni_id.lock().unwrap();
            *id += 1;
            let name = format!("eni-{id}");
            self.created.lock().unwrap().push(name.clone());
            Ok(name)
        }
        fn attach_network_interface(&self, _vni_id: &str, _device_index: u32) -> anyhow::Result<String> {
            Ok("attach-fake".to_string())
        }
        fn modify_delete_on_termination(&self, _vni_id: &str, _attachment_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn detach_network_interface(&self, _attachment_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete_network_interface(&self, _vni_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn describe_network_interface_status(&self, _vni_id: &str) -> anyhow::Result<(String, String)> {
            Ok(("available".to_string(), "attach-fake".to_string()))
        }
        fn subnets_for_instance(&self, _availability_zone: &str) -> anyhow::Result<Vec<Subnet>> {
            Ok(self.subnets.clone())
        }
        fn describe_instance_type_limits(&self, _instance_type: &str) -> anyhow::Result<Limits> {
            Ok(self.limits)
        }
        fn describe_vpc_cidrs(&self, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>> {
            Ok(self.vpc_cidrs.get(vpc_id).cloned().unwrap_or_default())
        }
        fn describe_vpc_peer_cidrs(&self, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>> {
            Ok(self.vpc_peer_cidrs.get(vpc_id).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
const FALLBACK_FOR_TESTS: Limits = FALLBACK;
use crate::limits::FALLBACK;
