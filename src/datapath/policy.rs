//! Policy-routing table allocation: probe for a free table number and
//! claim it by writing every route for this pod, retrying with
//! exponential-backoff-with-full-jitter on collision.

use std::net::Ipv4Addr;
use std::thread::sleep;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use rand::Rng;

use crate::errors::{Result, VniError};
use crate::kernel::KernelOps;

const MAX_ATTEMPTS: u32 = 10;
const BASE_SLEEP_MS: u64 = 20;
const MAX_SLEEP_MS: u64 = 10_000;
pub const POD_RULE_PRIORITY: u32 = 1024;
pub const NODE_PORT_RULE_PRIORITY: u32 = 512;

/// Smallest table number `>= start` not already claimed by an existing
/// rule, checked across both IPv4 and IPv6 rule sets.
pub fn find_free_table(kernel: &dyn KernelOps, start: u32) -> Result<u32> {
    let in_use = kernel
        .rule_tables_in_use()
        .map_err(|e| VniError::KernelOpFailure { op: "RuleList", detail: e.to_string() })?;
    let mut table = start;
    while in_use.contains(&table) {
        table += 1;
    }
    Ok(table)
}

/// Installs one route per `(dst, gateway)` pair into a freshly claimed
/// table, then the `iif` rule pointing pod-originated traffic at it.
/// Retries on route-add collision against a concurrently claimed table.
pub fn add_policy_rules(
    kernel: &dyn KernelOps,
    veth_name: &str,
    routes: &[(Ipv4Network, Ipv4Addr)],
    table_start: u32,
) -> Result<u32> {
    let mut rng = rand::thread_rng();
    let mut sorted_routes = routes.to_vec();
    sorted_routes.sort_by_key(|(dst, _)| dst.to_string());

    for attempt in 0..MAX_ATTEMPTS {
        let probe_start = table_start + rng.gen_range(0..1000);
        let table = find_free_table(kernel, probe_start)?;

        let mut failed = false;
        for (dst, gateway) in &sorted_routes {
            if kernel.add_table_route(veth_name, *dst, *gateway, table).is_err() {
                failed = true;
                break;
            }
        }
        if !failed {
            kernel
                .add_iif_rule(veth_name, table, POD_RULE_PRIORITY)
                .map_err(|e| VniError::KernelOpFailure { op: "RuleAdd", detail: e.to_string() })?;
            return Ok(table);
        }

        let wait_ms = (BASE_SLEEP_MS * 2u64.pow(attempt)).min(MAX_SLEEP_MS);
        let jittered = rng.gen_range(0..=wait_ms);
        sleep(Duration::from_millis(jittered));
    }

    Err(VniError::TableExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeKernel;

    #[test]
    fn concurrent_allocations_get_distinct_tables() {
        let kernel = FakeKernel::new();
        let routes = vec![("10.0.0.0/16".parse().unwrap(), "10.0.1.5".parse().unwrap())];
        let t1 = add_policy_rules(&kernel, "veth1", &routes, 256).unwrap();
        let t2 = add_policy_rules(&kernel, "veth2", &routes, 256).unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn finds_first_free_table_from_start() {
        let kernel = FakeKernel::new();
        kernel.tables_in_use.lock().unwrap().insert(256);
        kernel.tables_in_use.lock().unwrap().insert(257);
        let table = find_free_table(&kernel, 256).unwrap();
        assert_eq!(table, 258);
    }
}
