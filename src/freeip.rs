//! Free-IP scanner: assigned-per-metadata minus bound-in-kernel, with an
//! optional registry reconciliation pass.

use std::net::Ipv4Addr;

use crate::kernel::KernelOps;
use crate::metadata::{MetadataSource, Vni};
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct FreeIp {
    pub ip: Ipv4Addr,
    pub vni: Vni,
}

/// Computes every metadata-assigned IP that has no matching kernel-bound
/// address, restricted to VNIs at or above `min_device_index`. When
/// `update_registry` is set, also reconciles the registry: free-and-unseen
/// IPs are tracked as free-as-of-now, in-use IPs are forgotten.
pub fn find_free_ips(
    metadata: &dyn MetadataSource,
    kernel: &dyn KernelOps,
    registry: Option<&Registry>,
    min_device_index: u32,
) -> anyhow::Result<Vec<FreeIp>> {
    let interfaces = metadata.interfaces()?;
    let bound = kernel.bound_ipv4s()?;

    let mut free = Vec::new();
    for vni in interfaces.into_iter().filter(|v| v.device_index >= min_device_index) {
        for ip in &vni.ipv4s {
            let in_use = bound.iter().any(|b| b.ip == *ip);
            if !in_use {
                free.push(FreeIp { ip: *ip, vni: vni.clone() });
            }
            if let Some(registry) = registry {
                if !in_use && !registry.has(*ip) {
                    registry.track(*ip);
                } else if in_use {
                    registry.forget(*ip);
                }
            }
        }
    }
    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeKernel;
    use crate::kernel::BoundAddr;
    use crate::metadata::fake::FakeMetadata;
    use ipnetwork::Ipv4Network;

    fn vni(idx: u32, ips: &[&str]) -> Vni {
        Vni {
            id: format!("eni-{idx}"),
            mac: format!("02:00:00:00:00:{idx:02x}"),
            device_index: idx,
            ipv4s: ips.iter().map(|s| s.parse().unwrap()).collect(),
            subnet_id: "subnet-1".to_string(),
            subnet_cidr: "10.0.0.0/24".parse::<Ipv4Network>().unwrap(),
            vpc_id: "vpc-1".to_string(),
            vpc_primary_cidr: "10.0.0.0/16".parse::<Ipv4Network>().unwrap(),
            vpc_cidrs: vec![],
            security_group_ids: vec![],
        }
    }

    #[test]
    fn reports_unbound_ips_as_free() {
        let metadata = FakeMetadata::new(vec![vni(0, &["10.0.0.10", "10.0.0.11"])]);
        let kernel = FakeKernel::new();
        kernel.bound.lock().unwrap().push(BoundAddr {
            ip: "10.0.0.10".parse().unwrap(),
            label: "eth0".to_string(),
        });
        let free = find_free_ips(&metadata, &kernel, None, 0).unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].ip, "10.0.0.11".parse::<Ipv4Addr>().unwrap());
    }
}
