//! Cached views over VPC CIDRs and peer CIDRs, plus the metadata-bug
//! compatibility check that routes certain instance families around a
//! broken metadata field.

use std::time::Duration;

use ipnetwork::Ipv4Network;

use crate::cache::{Cache, GetState};
use crate::cloud::{has_bug_broken_vpc_cidrs, CloudApi};

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

pub fn vpc_cidrs(cache: &Cache, cloud: &dyn CloudApi, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>> {
    let key = format!("vpc-cidr-{vpc_id}");
    if let (GetState::Found, Some(cidrs)) = cache.get::<Vec<Ipv4Network>>(&key) {
        return Ok(cidrs);
    }
    let cidrs = cloud.describe_vpc_cidrs(vpc_id)?;
    cache.store(&key, CACHE_TTL, &cidrs);
    Ok(cidrs)
}

pub fn vpc_peer_cidrs(cache: &Cache, cloud: &dyn CloudApi, vpc_id: &str) -> anyhow::Result<Vec<Ipv4Network>> {
    let key = format!("vpc-peer-cidr-{vpc_id}");
    if let (GetState::Found, Some(cidrs)) = cache.get::<Vec<Ipv4Network>>(&key) {
        return Ok(cidrs);
    }
    let cidrs = cloud.describe_vpc_peer_cidrs(vpc_id)?;
    cache.store(&key, CACHE_TTL, &cidrs);
    Ok(cidrs)
}

/// Resolves the VPC CIDR list a freshly allocated VNI should route
/// against: the metadata tree's own list, unless this instance type is
/// known to drop secondary CIDRs from metadata, in which case the cloud
/// API answer is substituted.
pub fn resolve_vpc_cidrs(
    cache: &Cache,
    cloud: &dyn CloudApi,
    instance_type: &str,
    vpc_id: &str,
    metadata_cidrs: &[Ipv4Network],
) -> anyhow::Result<Vec<Ipv4Network>> {
    if has_bug_broken_vpc_cidrs(instance_type) {
        vpc_cidrs(cache, cloud, vpc_id)
    } else {
        Ok(metadata_cidrs.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloud;

    #[test]
    fn bug_table_substitutes_cloud_answer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let mut cloud = FakeCloud::new();
        cloud
            .vpc_cidrs
            .insert("vpc-1".to_string(), vec!["10.0.0.0/16".parse().unwrap()]);
        let metadata_cidrs = vec!["192.168.0.0/16".parse().unwrap()];
        let resolved = resolve_vpc_cidrs(&cache, &cloud, "m5.large", "vpc-1", &metadata_cidrs).unwrap();
        assert_eq!(resolved, vec!["10.0.0.0/16".parse::<Ipv4Network>().unwrap()]);
    }

    #[test]
    fn non_bug_family_uses_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let cloud = FakeCloud::new();
        let metadata_cidrs = vec!["192.168.0.0/16".parse().unwrap()];
        let resolved = resolve_vpc_cidrs(&cache, &cloud, "t3.large", "vpc-1", &metadata_cidrs).unwrap();
        assert_eq!(resolved, metadata_cidrs);
    }
}
