use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use hubmesh_core::delivery::{HubRegistry, LocalDelivery};
use hubmesh_core::hub::Hub;

type Factory = Arc<dyn Fn() -> Arc<dyn LocalDelivery> + Send + Sync>;

/// Hub registry that builds each hub's delivery service on first use.
///
/// Construction happens under the map's entry lock, so concurrent first
/// lookups of one hub build exactly one instance.
#[derive(Default)]
pub struct LazyHubRegistry {
    factories: DashMap<String, Factory>,
    instances: DashMap<String, Arc<dyn LocalDelivery>>,
}

impl LazyHubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register how to build the delivery service for `H`.
    ///
    /// Replaces an earlier factory. An instance already built is kept.
    pub fn register<H, F>(&self, factory: F)
    where
        H: Hub,
        F: Fn() -> Arc<dyn LocalDelivery> + Send + Sync + 'static,
    {
        let _ = self.factories.insert(H::NAME.to_string(), Arc::new(factory));
        debug!(hub = H::NAME, "hub registered");
    }

    pub fn is_registered(&self, hub: &str) -> bool {
        self.factories.contains_key(hub)
    }

    /// Number of hubs whose delivery service has been built.
    pub fn instantiated(&self) -> usize {
        self.instances.len()
    }

    /// Registered hub names, sorted.
    pub fn hubs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl HubRegistry for LazyHubRegistry {
    fn resolve(&self, hub: &str) -> Option<Arc<dyn LocalDelivery>> {
        if let Some(existing) = self.instances.get(hub) {
            return Some(Arc::clone(existing.value()));
        }
        let factory = Arc::clone(self.factories.get(hub)?.value());
        let entry = self.instances.entry(hub.to_string()).or_insert_with(|| {
            debug!(hub, "building hub delivery service");
            factory()
        });
        Some(Arc::clone(entry.value()))
    }
}
