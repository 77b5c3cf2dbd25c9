//! Backend Adapters
//!
//! Each adapter pairs a [`LeaseBackend`](crate::session::LeaseBackend) for
//! registration with a [`ChangeSource`](crate::discovery::ChangeSource) for
//! discovery over the same storage layout.

pub mod consul;
pub mod etcd;
pub mod kubernetes;

use strum::{Display, EnumString, IntoStaticStr, VariantNames};

pub use consul::{ConsulApi, ConsulBackend, ConsulChangeSource};
pub use etcd::{EtcdBackend, EtcdChangeSource};
pub use kubernetes::{KubeBackend, KubeChangeSource};

/// Supported coordination backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, VariantNames)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    Etcd,
    Consul,
    #[strum(serialize = "kubernetes", serialize = "k8s")]
    Kubernetes,
}
