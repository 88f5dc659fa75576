//! Closed error taxonomy for the allocator, registry, and datapath.
//!
//! Call sites that need free-form context (collaborator I/O bubbling up)
//! wrap these in `anyhow::Error`; these variants exist at the boundaries
//! that callers actually need to match on, not on every fallible call.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VniError {
    #[error("lockfile not acquired after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("instance metadata not available: {0}")]
    MetadataUnavailable(String),

    #[error("cloud API call {op} failed: {source}")]
    CloudApiFailure {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("allocation requested but never converged in metadata")]
    AllocationUnconverged,

    #[error("instance already has the maximum number of adapters attached")]
    AdapterLimitExceeded,

    #[error("no subnet with available addresses matches the required tags")]
    SubnetExhausted,

    #[error("ip {0} is not assigned to any known interface")]
    IpNotFound(Ipv4Addr),

    #[error("exhausted policy route table probe attempts")]
    TableExhausted,

    #[error("new interface did not settle in metadata in time")]
    InterfaceSettleFailure,

    #[error("registry contents were corrupt or unversioned, resetting")]
    RegistryCorrupt,

    #[error("kernel operation {op} failed: {detail}")]
    KernelOpFailure { op: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, VniError>;
