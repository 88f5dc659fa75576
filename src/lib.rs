pub mod allocator;
pub mod cache;
pub mod cloud;
pub mod cni;
pub mod config;
pub mod datapath;
pub mod errors;
pub mod freeip;
pub mod ipam;
pub mod kernel;
pub mod limits;
pub mod lock;
pub mod logging;
pub mod metadata;
pub mod registry;
pub mod subnets;
pub mod timestamp;
pub mod vpc;
