//! Per-destination host-state cache for a recursive resolver: rtt, EDNS and
//! lameness per (server address, zone), kept in a sharded LRU table whose
//! records are recycled through a two-level pool.

pub mod alloc;
pub mod config;
pub mod infra;
pub mod lruhash;
pub mod rtt;
pub mod slabhash;
pub mod watcher;

pub use config::{InfraConfig, InfraSettings, load_config};
pub use infra::{EdnsStatus, HostData, HostInfo, HostKey, HostRto, InfraCache, InfraStats, LameRtt};
pub use rtt::{RttBounds, RttInfo};
