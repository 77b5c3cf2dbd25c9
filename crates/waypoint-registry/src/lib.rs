//! Waypoint Registry
//!
//! Lease-backed registration sessions and method-indexed discovery caches
//! over etcd, Consul and Kubernetes ConfigMaps.

pub mod backends;
pub mod config;
pub mod contract;
pub mod discovery;
pub mod observability;
pub mod session;

pub use backends::BackendKind;
pub use config::RegistryConfig;
pub use contract::{node_for_services, register_services, Discovery, Register};
pub use discovery::{
    CacheBuilder, ChangeBatch, ChangeEvent, ChangeSource, DiscoveryCache, Snapshot,
};
pub use session::{
    LeaseBackend, LeaseHandle, LogSink, RegistrationSession, RetryHook, SessionBuilder,
    SessionExit, SessionState, TracingSink,
};
