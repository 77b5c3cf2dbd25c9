//! Backend-agnostic contracts
//!
//! Object-safe views of sessions and caches so callers can hold
//! `Arc<dyn Register>` / `Arc<dyn Discovery>` without naming the backend.

use crate::discovery::{ChangeSource, DiscoveryCache};
use crate::session::{LeaseBackend, RegistrationSession, SessionExit};
use async_trait::async_trait;
use std::sync::Arc;
use waypoint_core::{MethodSet, Result, ServiceDescriptor, ServiceNode};

/// Publish one node and keep it alive.
#[async_trait]
pub trait Register: Send + Sync {
    async fn install(&self, node: ServiceNode) -> Result<()>;

    async fn uninstall(&self);

    /// Blocks until cancelled or recovery is exhausted.
    async fn sustain_lease(&self) -> SessionExit;
}

/// Look up nodes by method.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn get_service(&self, method: &str) -> Result<Vec<Arc<ServiceNode>>>;

    fn get_nodes(&self, app_id: &str) -> Result<Vec<Arc<ServiceNode>>>;

    /// Blocks until [`unwatch`](Discovery::unwatch).
    async fn watcher(&self);

    fn unwatch(&self);
}

#[async_trait]
impl<B: LeaseBackend> Register for RegistrationSession<B> {
    async fn install(&self, node: ServiceNode) -> Result<()> {
        RegistrationSession::install(self, node).await
    }

    async fn uninstall(&self) {
        RegistrationSession::uninstall(self).await
    }

    async fn sustain_lease(&self) -> SessionExit {
        RegistrationSession::sustain_lease(self).await
    }
}

#[async_trait]
impl<S: ChangeSource> Discovery for DiscoveryCache<S> {
    fn get_service(&self, method: &str) -> Result<Vec<Arc<ServiceNode>>> {
        DiscoveryCache::get_service(self, method)
    }

    fn get_nodes(&self, app_id: &str) -> Result<Vec<Arc<ServiceNode>>> {
        DiscoveryCache::get_nodes(self, app_id)
    }

    async fn watcher(&self) {
        DiscoveryCache::watcher(self).await
    }

    fn unwatch(&self) {
        DiscoveryCache::unwatch(self)
    }
}

/// Node advertising every method of `descriptors`.
pub fn node_for_services(descriptors: &[ServiceDescriptor]) -> ServiceNode {
    ServiceNode {
        proto_count: u32::try_from(descriptors.len()).unwrap_or(u32::MAX),
        methods: MethodSet::from_descriptors(descriptors),
        ..Default::default()
    }
}

/// Install a node serving `descriptors` through any registration.
pub async fn register_services(
    register: &dyn Register,
    descriptors: &[ServiceDescriptor],
) -> Result<()> {
    register.install(node_for_services(descriptors)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::FakeBackend;
    use waypoint_core::{Meta, ServiceConf};

    #[test]
    fn test_node_for_services() {
        let node = node_for_services(&[
            ServiceDescriptor::new("helloworld.Greeter", &["SayHello"]),
            ServiceDescriptor::new("health.Health", &["Check", "Watch"]),
        ]);
        assert_eq!(node.proto_count, 2);
        assert_eq!(node.methods.len(), 3);
        assert!(node.check_method("/health.Health/Watch").is_ok());
    }

    #[tokio::test]
    async fn test_register_services_through_trait_object() {
        let backend = FakeBackend::default();
        let session = RegistrationSession::builder(
            backend.clone(),
            Meta::new("prod", "greeter", "v2"),
            ServiceConf::default(),
        )
        .connect()
        .await
        .unwrap();
        let register: Arc<dyn Register> = Arc::new(session);

        register_services(
            register.as_ref(),
            &[ServiceDescriptor::new("helloworld.Greeter", &["SayHello"])],
        )
        .await
        .unwrap();

        let state = backend.state.lock();
        let written = state.puts.last().unwrap();
        assert_eq!(written.proto_count, 1);
        assert!(written.methods.contains("/helloworld.Greeter/SayHello"));
        assert_eq!(written.meta.app_id, "greeter");
    }
}
