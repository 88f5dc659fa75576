//! Unnumbered-PTP CNI plugin entry point: the second link in the chain.
//! Wires the veth pair and policy routing using the IPAM chain's result.

use slog::{info, o};
use slog_scope::logger;

use vni_ptp_cni::cni::{read_stdin, print_result, CniArgs, CniResult, PtpConfig};
use vni_ptp_cni::config::RuntimeConfig;
use vni_ptp_cni::datapath::add::{add, AddContext};
use vni_ptp_cni::datapath::del::{del, DelContext};
use vni_ptp_cni::errors::{Result, VniError};
use vni_ptp_cni::kernel::iptables::ShellIptables;
use vni_ptp_cni::kernel::netlink::NetlinkOps;
use vni_ptp_cni::logging;

fn main() {
    vni_ptp_cni::kernel::assert_single_threaded();

    let config = RuntimeConfig::from_env();
    let _guard = logging::init(&config);

    if let Err(e) = run(&config) {
        eprintln!("vni-ptp: {e}");
        std::process::exit(1);
    }
}

fn run(config: &RuntimeConfig) -> Result<()> {
    let args = CniArgs::from_env().map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
    let stdin = read_stdin().map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
    let ptp_config: PtpConfig =
        serde_json::from_slice(&stdin).map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;

    let kernel = NetlinkOps::new();
    let iptables = ShellIptables::new();
    let log = logger().new(o!("command" => args.command.clone(), "container_id" => args.container_id.clone()));

    match args.command.as_str() {
        "ADD" => {
            let prev_result: CniResult = match &ptp_config.prev_result {
                Some(raw) => serde_json::from_value(raw.clone())
                    .map_err(|e| VniError::MetadataUnavailable(format!("could not parse prevResult: {e}")))?,
                None => return Err(VniError::MetadataUnavailable("must be called as chained plugin".into())),
            };

            let ctx = AddContext { kernel: &kernel, iptables: &iptables };
            let netns = args
                .netns
                .as_ref()
                .ok_or_else(|| VniError::MetadataUnavailable("CNI_NETNS not set".into()))?;
            let lock_path = config.lock_path();
            let result = vni_ptp_cni::lock::run(&lock_path, || {
                add(&ctx, &ptp_config.name, &args.container_id, netns, &args.ifname, &ptp_config, prev_result)
            })?;
            info!(log, "wired datapath"; "interfaces" => result.interfaces.len());
            print_result(&result).map_err(|e| VniError::MetadataUnavailable(e.to_string()))?;
        }
        "DEL" => {
            let ctx = DelContext { kernel: &kernel, iptables: &iptables };
            let lock_path = config.lock_path();
            vni_ptp_cni::lock::run(&lock_path, || {
                del(
                    &ctx,
                    &ptp_config.name,
                    &args.container_id,
                    args.netns.as_deref(),
                    &args.ifname,
                    &ptp_config.container_interface,
                    &ptp_config,
                )
            })?;
        }
        "CHECK" | "VERSION" => {}
        other => {
            return Err(VniError::MetadataUnavailable(format!("unsupported CNI_COMMAND {other}")));
        }
    }
    Ok(())
}
