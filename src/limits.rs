//! Per-instance-type adapter/IPv4/IPv6 limits, cached 24h, with a
//! conservative fallback when the cloud API can't answer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, GetState};
use crate::cloud::CloudApi;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub adapters: u32,
    pub ipv4: u32,
    pub ipv6: u32,
}

pub const FALLBACK: Limits = Limits {
    adapters: 4,
    ipv4: 15,
    ipv6: 15,
};

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolves the limits for `instance_type`, falling back to `FALLBACK` when
/// the cloud API can't answer. The fallback is returned alongside the error
/// that caused it rather than swallowing the failure, mirroring the
/// original's `return &defaultLimit, errors.Wrap(err, ...)`.
pub fn resolve(cache: &Cache, cloud: &dyn CloudApi, instance_type: &str) -> (Limits, Option<anyhow::Error>) {
    let key = format!("eni_limits_for_{instance_type}");
    if let (GetState::Found, Some(limits)) = cache.get::<Limits>(&key) {
        return (limits, None);
    }
    match cloud.describe_instance_type_limits(instance_type) {
        Ok(limits) => {
            cache.store(&key, CACHE_TTL, &limits);
            (limits, None)
        }
        Err(e) => (FALLBACK, Some(e.context("describe_instance_type_limits failed, using fallback limits"))),
    }
}
