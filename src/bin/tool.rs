//! Diagnostic and maintenance CLI built on the same allocator/cloud/kernel
//! core the two CNI plugins use. Mutating subcommands take the host-wide
//! file lock; read-only diagnostics do not.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use rand::Rng;

use vni_ptp_cni::allocator::Allocator;
use vni_ptp_cni::cache::Cache;
use vni_ptp_cni::cloud::{has_bug_broken_vpc_cidrs, CloudApi, HttpCloudApi};
use vni_ptp_cni::config::RuntimeConfig;
use vni_ptp_cni::errors::{Result, VniError};
use vni_ptp_cni::freeip::find_free_ips;
use vni_ptp_cni::kernel::netlink::NetlinkOps;
use vni_ptp_cni::kernel::KernelOps;
use vni_ptp_cni::limits;
use vni_ptp_cni::lock;
use vni_ptp_cni::logging;
use vni_ptp_cni::metadata::{resolve_local_name, HttpMetadataSource, MetadataSource};
use vni_ptp_cni::registry::Registry;
use vni_ptp_cni::vpc::{vpc_cidrs, vpc_peer_cidrs};

const METADATA_ENDPOINT_ENV: &str = "VNI_METADATA_ENDPOINT";
const CLOUD_ENDPOINT_ENV: &str = "VNI_CLOUD_ENDPOINT";
const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254/latest/meta-data/";
const DEFAULT_CLOUD_ENDPOINT: &str = "http://169.254.169.254/cloud-api/";

#[derive(Parser)]
#[command(name = "vni-tool", version, about = "Interface with cloud VNI adapters and the CNI bindings for them")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a new VNI and attach it to this instance
    NewInterface {
        /// Required subnet tag filter, e.g. -t kubernetes.io/role=node
        #[arg(long = "subnet-filter", value_delimiter = ',', value_parser = parse_tag)]
        tags: Vec<(String, String)>,
        /// Security group ids to attach the new VNI with
        sec_group_ids: Vec<String>,
    },
    /// Detach and delete one or more VNIs
    RemoveInterface { interface_ids: Vec<String> },
    /// Release one or more private IPs back to the cloud
    Deallocate { ips: Vec<Ipv4Addr> },
    /// Allocate a secondary IP on the first VNI with room, at or above --index
    AllocateFirstAvailable {
        #[arg(long, default_value_t = 0)]
        index: u32,
    },
    /// List every metadata-assigned IP with no matching kernel-bound address
    FreeIps,
    /// List VNIs and their addressing
    Eniif,
    /// List all kernel-bound addresses
    Addr,
    /// Show subnets available to this instance
    Subnets,
    /// Show adapter/IPv4/IPv6 limits for this instance type
    Limits,
    /// Estimate how many pods this instance's networking can host
    Maxpods,
    /// Report whether this instance type has the broken-VPC-CIDR metadata bug
    Bugs,
    /// Show the primary VNI's VPC's CIDR blocks
    Vpccidr,
    /// Show the primary VNI's VPC's peered CIDR blocks
    Vpcpeercidr,
    /// List every IP tracked in the reuse-cooldown registry
    RegistryList,
    /// Deallocate and forget every registry entry older than --free-after
    RegistryGc {
        /// Duration string, e.g. "1h", "30m", "45s", "2d"
        #[arg(long = "free-after")]
        free_after: String,
    },
}

fn main() {
    let config = RuntimeConfig::from_env();
    let _guard = logging::init(&config);

    let metadata_endpoint = std::env::var(METADATA_ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_METADATA_ENDPOINT.to_string());
    let cloud_endpoint = std::env::var(CLOUD_ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_CLOUD_ENDPOINT.to_string());
    let metadata = HttpMetadataSource::new(metadata_endpoint);

    if !metadata.available() {
        eprintln!("vni-tool: this command must be run from within a running cloud instance");
        std::process::exit(1);
    }
    if !nix::unistd::Uid::current().is_root() {
        eprintln!("vni-tool: this command must be run as root");
        std::process::exit(1);
    }

    let cloud = HttpCloudApi::new(cloud_endpoint);
    let kernel = NetlinkOps::new();
    let cache = Cache::new(config.state_dir().join("cache"));
    let registry = Registry::new(config.state_dir().join("registry"));
    let allocator = Allocator { cloud: &cloud, metadata: &metadata, kernel: &kernel, cache: &cache, registry: &registry };

    let cli = Cli::parse();
    if let Err(e) = run(cli.command, &allocator, &config) {
        eprintln!("vni-tool: {e}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd, allocator: &Allocator, config: &RuntimeConfig) -> Result<()> {
    let lock_path = config.lock_path();
    match cmd {
        Cmd::NewInterface { tags, sec_group_ids } => {
            if sec_group_ids.is_empty() {
                eprintln!("please specify security groups");
                return Err(VniError::MetadataUnavailable("need security groups".into()));
            }
            let tag_map: HashMap<String, String> = tags.into_iter().collect();
            let vni = lock::run(&lock_path, || allocator.new_interface(&sec_group_ids, &tag_map))?;
            println!("{} ({})", vni.id, vni.local_name());
        }
        Cmd::RemoveInterface { interface_ids } => {
            if interface_ids.is_empty() {
                eprintln!("please specify an interface");
                return Err(VniError::MetadataUnavailable("insufficient arguments".into()));
            }
            lock::run(&lock_path, || allocator.remove_interfaces(&interface_ids))?;
        }
        Cmd::Deallocate { ips } => {
            if ips.is_empty() {
                eprintln!("please specify an ip");
                return Err(VniError::MetadataUnavailable("invalid ip".into()));
            }
            lock::run(&lock_path, || {
                for ip in &ips {
                    allocator.deallocate(*ip)?;
                }
                Ok(())
            })?;
        }
        Cmd::AllocateFirstAvailable { index } => {
            let results = lock::run(&lock_path, || allocator.allocate_first_available_at_index(index, 1))?;
            for r in results {
                println!("allocated {} on {}", r.ip, r.vni.local_name());
            }
        }
        Cmd::FreeIps => {
            let free = find_free_ips(allocator.metadata, allocator.kernel, None, 0)
                .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
            println!("{:<16}{}", "adapter", "ip");
            for ip in free {
                println!("{:<16}{}", ip.vni.local_name(), ip.ip);
            }
        }
        Cmd::Eniif => {
            let interfaces = allocator
                .metadata
                .interfaces()
                .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
            println!("{:<8}{:<20}{:<14}{:<12}{:<18}{:<24}{:<14}{}", "iface", "mac", "id", "subnet", "subnet_cidr", "secgrps", "vpc", "ips");
            for iface in interfaces {
                println!(
                    "{:<8}{:<20}{:<14}{:<12}{:<18}{:<24}{:<14}{:?}",
                    resolve_local_name(&iface),
                    iface.mac,
                    iface.id,
                    iface.subnet_id,
                    iface.subnet_cidr,
                    format!("{:?}", iface.security_group_ids),
                    iface.vpc_id,
                    iface.ipv4s,
                );
            }
        }
        Cmd::Addr => {
            let addrs = allocator
                .kernel
                .bound_ipv4s()
                .map_err(|e| VniError::KernelOpFailure { op: "AddrList", detail: e.to_string() })?;
            println!("{:<16}{}", "iface", "ip");
            for addr in addrs {
                println!("{:<16}{}", addr.label, addr.ip);
            }
        }
        Cmd::Subnets => {
            let az = allocator
                .metadata
                .availability_zone()
                .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
            let subnets = allocator
                .cloud
                .subnets_for_instance(&az)
                .map_err(|e| VniError::CloudApiFailure { op: "DescribeSubnets", source: e })?;
            println!("{:<14}{:<18}{:<10}{:<12}{}", "id", "cidr", "default", "available", "tags");
            for subnet in subnets {
                println!(
                    "{:<14}{:<18}{:<10}{:<12}{:?}",
                    subnet.id, subnet.cidr, subnet.is_default, subnet.available_address_count, subnet.tags
                );
            }
        }
        Cmd::Limits => {
            let itype = allocator
                .metadata
                .instance_type()
                .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
            let (limit, fallback_err) = limits::resolve(allocator.cache, allocator.cloud, &itype);
            if let Some(e) = fallback_err {
                eprintln!("warning: using fallback limits: {e:#}");
            }
            println!("{:<10}{:<6}{}", "adapters", "ipv4", "ipv6");
            println!("{:<10}{:<6}{}", limit.adapters, limit.ipv4, limit.ipv6);
        }
        Cmd::Maxpods => {
            let itype = allocator
                .metadata
                .instance_type()
                .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
            let (limit, fallback_err) = limits::resolve(allocator.cache, allocator.cloud, &itype);
            if let Some(e) = fallback_err {
                eprintln!("warning: using fallback limits: {e:#}");
            }
            let maxpods = limit.adapters * limit.ipv4 - limit.adapters;
            println!("{maxpods}");
        }
        Cmd::Bugs => {
            let itype = allocator
                .metadata
                .instance_type()
                .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
            println!(
                "{itype}: broken-vpc-cidrs={}",
                has_bug_broken_vpc_cidrs(&itype)
            );
        }
        Cmd::Vpccidr => {
            let vpc_id = primary_vpc_id(allocator)?;
            let cidrs = vpc_cidrs(allocator.cache, allocator.cloud, &vpc_id)
                .map_err(|e| VniError::CloudApiFailure { op: "DescribeVpcs", source: e })?;
            for cidr in cidrs {
                println!("{cidr}");
            }
        }
        Cmd::Vpcpeercidr => {
            let vpc_id = primary_vpc_id(allocator)?;
            let cidrs = vpc_peer_cidrs(allocator.cache, allocator.cloud, &vpc_id)
                .map_err(|e| VniError::CloudApiFailure { op: "DescribeRouteTables", source: e })?;
            for cidr in cidrs {
                println!("{cidr}");
            }
        }
        Cmd::RegistryList => {
            for ip in allocator.registry.list() {
                println!("{ip}");
            }
        }
        Cmd::RegistryGc { free_after } => {
            let base = parse_duration(&free_after)?;
            let jittered = jitter_up_to_15_percent(base);
            let cutoff = SystemTime::now() - jittered;
            lock::run(&lock_path, || registry_gc(allocator, cutoff))?;
        }
    }
    Ok(())
}

fn primary_vpc_id(allocator: &Allocator) -> Result<String> {
    let interfaces = allocator
        .metadata
        .interfaces()
        .map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
    interfaces
        .into_iter()
        .next()
        .map(|v| v.vpc_id)
        .ok_or_else(|| VniError::MetadataUnavailable("no VNIs attached".into()))
}

fn registry_gc(allocator: &Allocator, cutoff: SystemTime) -> Result<()> {
    let bound = allocator
        .kernel
        .bound_ipv4s()
        .map_err(|e| VniError::KernelOpFailure { op: "AddrList", detail: e.to_string() })?;
    for ip in allocator.registry.tracked_before(cutoff) {
        if bound.iter().any(|b| b.ip == ip) {
            allocator.registry.forget(ip);
            continue;
        }
        // Already deallocated (or never really assigned) is not fatal here;
        // the registry entry is stale either way and should still clear.
        let _ = allocator.deallocate(ip);
        allocator.registry.forget(ip);
    }
    Ok(())
}

fn jitter_up_to_15_percent(base: Duration) -> Duration {
    let extra_pct = rand::thread_rng().gen_range(0..=15);
    base + base * extra_pct / 100
}

fn parse_tag(s: &str) -> std::result::Result<(String, String), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected key=value, got {s}"))?;
    Ok((k.to_string(), v.to_string()))
}

fn parse_duration(s: &str) -> Result<Duration> {
    let err = || VniError::MetadataUnavailable(format!("invalid duration: {s}"));
    let s = s.trim();
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let count: u64 = num.parse().map_err(|_| err())?;
    let secs = match unit {
        "s" => count,
        "m" => count * 60,
        "h" => count * 3600,
        "d" => count * 86400,
        _ => return Err(err()),
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hour_and_day_suffixes() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn jitter_never_shrinks_the_base() {
        let base = Duration::from_secs(1000);
        for _ in 0..20 {
            let jittered = jitter_up_to_15_percent(base);
            assert!(jittered >= base);
            assert!(jittered <= base + base * 15 / 100);
        }
    }
}
