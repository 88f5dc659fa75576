//! IPAM-chain CNI plugin entry point: allocates one secondary IP per ADD,
//! releases it (starting the reuse cooldown) per DEL.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use slog::{info, o};
use slog_scope::logger;

use vni_ptp_cni::cache::Cache;
use vni_ptp_cni::cloud::HttpCloudApi;
use vni_ptp_cni::cni::{read_stdin, print_result, CniArgs, IpamConfig};
use vni_ptp_cni::config::RuntimeConfig;
use vni_ptp_cni::errors::Result;
use vni_ptp_cni::ipam::{self, IpamContext};
use vni_ptp_cni::kernel::netlink::NetlinkOps;
use vni_ptp_cni::kernel::KernelOps;
use vni_ptp_cni::logging;
use vni_ptp_cni::metadata::HttpMetadataSource;
use vni_ptp_cni::registry::Registry;
use vni_ptp_cni::{lock, errors::VniError};

const METADATA_ENDPOINT_ENV: &str = "VNI_METADATA_ENDPOINT";
const CLOUD_ENDPOINT_ENV: &str = "VNI_CLOUD_ENDPOINT";
const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254/latest/meta-data/";
const DEFAULT_CLOUD_ENDPOINT: &str = "http://169.254.169.254/cloud-api/";

fn main() {
    // Namespace entry is only safe from a single-threaded process; this
    // mirrors the Go original's `runtime.LockOSThread()` in `init()`.
    vni_ptp_cni::kernel::assert_single_threaded();

    let config = RuntimeConfig::from_env();
    let _guard = logging::init(&config);

    if let Err(e) = run(&config) {
        eprintln!("vni-ipam: {e}");
        std::process::exit(1);
    }
}

fn run(config: &RuntimeConfig) -> Result<()> {
    let args = CniArgs::from_env().map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
    let stdin = read_stdin().map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
    let ipam_config: IpamConfig =
        serde_json::from_slice(&stdin).map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;

    let metadata_endpoint =
        std::env::var(METADATA_ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_METADATA_ENDPOINT.to_string());
    let cloud_endpoint = std::env::var(CLOUD_ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_CLOUD_ENDPOINT.to_string());

    let metadata = HttpMetadataSource::new(metadata_endpoint);
    let cloud = HttpCloudApi::new(cloud_endpoint);
    let kernel = NetlinkOps::new();
    let cache = Cache::new(config.state_dir().join("cache"));
    let registry = Registry::new(config.state_dir().join("registry"));
    let ctx = IpamContext { cloud: &cloud, metadata: &metadata, kernel: &kernel, cache: &cache, registry: &registry };

    let log = logger().new(o!("command" => args.command.clone(), "container_id" => args.container_id.clone()));

    match args.command.as_str() {
        "ADD" => {
            let lock_path = config.lock_path();
            let result = lock::run(&lock_path, || ipam::add(&ctx, &ipam_config))?;
            info!(log, "allocated secondary ip"; "ips" => format!("{:?}", result.ips));
            print_result(&result).map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
        }
        "DEL" => {
            let container_ips = container_ipv4s(&kernel, &args, &ipam_config)?;
            let lock_path = config.lock_path();
            lock::run(&lock_path, || ipam::del(&ctx, &ipam_config, &container_ips))?;
        }
        "CHECK" | "VERSION" => {}
        other => {
            return Err(VniError::MetadataUnavailable(format!("unsupported CNI_COMMAND {other}")));
        }
    }
    Ok(())
}

fn container_ipv4s(kernel: &NetlinkOps, args: &CniArgs, _config: &IpamConfig) -> Result<Vec<Ipv4Addr>> {
    let Some(netns) = &args.netns else { return Ok(Vec::new()) };
    let ifname = args.ifname.clone();
    let netns_path: PathBuf = netns.clone();
    let mut ips = Vec::new();
    let result = kernel.run_in_netns(&netns_path, &mut || {
        ips = kernel.addresses(&ifname)?;
        Ok(())
    });
    // A namespace that no longer exists means the pod is already gone;
    // DEL must still succeed so the runtime can finish cleanup.
    if result.is_err() {
        return Ok(Vec::new());
    }
    Ok(ips)
}
