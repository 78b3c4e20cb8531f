//! # Prometheus Metrics
//!
//! Operational gauges for one hover peer, served at `GET /metrics` on the
//! admin port. All metrics live in a dedicated registry so nothing collides
//! with other consumers of the default global one. The gauges are snapshots
//! refreshed by the handler at scrape time — the coordination plane is not
//! in the business of pushing metrics.

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// All metric handles for the daemon.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Peers currently in the live set.
    pub peers_alive: IntGauge,
    /// Peers currently considered dead.
    pub peers_dead: IntGauge,
    /// Live (non-tombstoned, assignable) resources in the replicated map.
    pub resources: IntGauge,
    /// Resources installed on this host by the platform shim.
    pub resources_installed: IntGauge,
    /// Total keystore writes since startup.
    pub keystore_writes: IntGauge,
    /// 1 when this peer currently believes it is the leader.
    pub is_leader: IntGauge,
    /// 1 when the gateway answers pings.
    pub connectivity_up: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("hover".into()), None)
            .expect("failed to create prometheus registry");

        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let gauge = IntGauge::new(name, help).expect("metric creation");
            registry
                .register(Box::new(gauge.clone()))
                .expect("metric registration");
            gauge
        }

        NodeMetrics {
            peers_alive: gauge(&registry, "peers_alive", "Peers currently in the live set"),
            peers_dead: gauge(&registry, "peers_dead", "Peers currently considered dead"),
            resources: gauge(&registry, "resources", "Assignable resources in the replicated map"),
            resources_installed: gauge(
                &registry,
                "resources_installed",
                "Resources installed on this host",
            ),
            keystore_writes: gauge(
                &registry,
                "keystore_writes_total",
                "Keystore writes since startup",
            ),
            is_leader: gauge(&registry, "is_leader", "1 when this peer is the elected leader"),
            connectivity_up: gauge(
                &registry,
                "connectivity_up",
                "1 when the upstream gateway answers pings",
            ),
            registry,
        }
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle for handlers and background tasks.
pub type SharedMetrics = Arc<NodeMetrics>;
