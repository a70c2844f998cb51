use std::sync::Arc;

use tracing::info;

use modelmux_common::{RoutingConfig, Upstream, UpstreamId};

use crate::affinity::AffinityStore;
use crate::breaker::{CircuitBreaker, PersistedCircuitState};
use crate::catalog::UpstreamCatalog;
use crate::counters::{ConnectionCounters, RoundRobinCursors};
use crate::health::{HealthRecord, HealthTracker};
use crate::normalize::{CapabilityNormalizer, CapabilityStore};
use crate::outcome::OutcomeReporter;
use crate::quota::QuotaTracker;
use crate::resolver::{RedirectError, validate_redirects};
use crate::selector::UpstreamSelector;
use crate::sink::StateSink;

/// Everything the store hands over at bootstrap.
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    pub upstreams: Vec<Upstream>,
    pub circuit_states: Vec<(UpstreamId, PersistedCircuitState)>,
    pub health_records: Vec<(UpstreamId, HealthRecord)>,
}

/// Process-scoped assembly of the routing core: catalog, breaker, affinity,
/// health, selector, and outcome reporting wired to one sink.
///
/// `start` spawns the affinity sweep; `shutdown` stops it and clears the
/// in-memory session state so tests and restarts are deterministic.
pub struct Router {
    pub catalog: Arc<UpstreamCatalog>,
    pub breaker: Arc<CircuitBreaker>,
    pub affinity: Arc<AffinityStore>,
    pub health: Arc<HealthTracker>,
    pub counters: Arc<ConnectionCounters>,
    pub cursors: Arc<RoundRobinCursors>,
    pub selector: UpstreamSelector,
    pub outcomes: OutcomeReporter,
    pub normalizer: CapabilityNormalizer,
}

impl Router {
    pub fn new(
        config: RoutingConfig,
        quota: Arc<dyn QuotaTracker>,
        sink: Arc<dyn StateSink>,
    ) -> Arc<Self> {
        let catalog = Arc::new(UpstreamCatalog::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker, Arc::clone(&sink)));
        let affinity = Arc::new(AffinityStore::new(config.affinity));
        let health = Arc::new(HealthTracker::new(Arc::clone(&sink)));
        let counters = Arc::new(ConnectionCounters::new());
        let cursors = Arc::new(RoundRobinCursors::new());

        let selector = UpstreamSelector::new(
            Arc::clone(&catalog),
            Arc::clone(&breaker),
            Arc::clone(&affinity),
            quota,
            Arc::clone(&counters),
            Arc::clone(&sink),
            config.selector,
        );
        let outcomes = OutcomeReporter::new(
            Arc::clone(&breaker),
            Arc::clone(&affinity),
            Arc::clone(&health),
            Arc::clone(&catalog),
            Arc::clone(&counters),
        );

        Arc::new(Self {
            catalog,
            breaker,
            affinity,
            health,
            counters,
            cursors,
            selector,
            outcomes,
            normalizer: CapabilityNormalizer::new(),
        })
    }

    /// Build and seed a router from the persisted snapshot in one call.
    pub fn from_snapshot(
        config: RoutingConfig,
        snapshot: RoutingSnapshot,
        quota: Arc<dyn QuotaTracker>,
        sink: Arc<dyn StateSink>,
    ) -> Arc<Self> {
        let router = Self::new(config, quota, sink);

        for upstream in &snapshot.upstreams {
            router
                .breaker
                .configure(&upstream.id, upstream.breaker_override);
        }
        for (upstream_id, persisted) in &snapshot.circuit_states {
            router.breaker.seed(upstream_id, persisted);
        }
        router.catalog.replace_snapshot(snapshot.upstreams);
        // Merge the persisted latency observation onto the catalog row; the
        // rest of the health record stays display-only.
        for (upstream_id, record) in snapshot.health_records {
            if let Some(latency_ms) = record.latency_ms {
                router.catalog.record_latency(&upstream_id, latency_ms);
            }
            router.health.seed(&upstream_id, record);
        }

        info!(
            event = "router_bootstrap",
            upstreams = router.catalog.len(),
        );
        router
    }

    /// Start background maintenance (the affinity sweep). Idempotent.
    pub fn start(self: &Arc<Self>) {
        self.affinity.spawn_sweep_task();
    }

    /// Stop background work and drop per-session state.
    pub fn shutdown(&self) {
        self.affinity.shutdown();
        info!(event = "router_shutdown");
    }

    /// Admin upsert. Redirect maps are validated before anything is applied;
    /// a cyclic map rejects the whole operation.
    pub fn apply_upstream_upsert(&self, upstream: Upstream) -> Result<(), RedirectError> {
        if let Some(redirects) = &upstream.model_redirects {
            validate_redirects(redirects)?;
        }
        self.breaker
            .configure(&upstream.id, upstream.breaker_override);
        self.catalog.upsert(upstream);
        Ok(())
    }

    pub fn apply_upstream_remove(&self, upstream_id: &UpstreamId) {
        self.catalog.remove(upstream_id);
    }

    /// Run the route-capability reconciliation against the store. Safe to
    /// call from every bootstrap; it does real work at most once per process.
    pub async fn normalize_capabilities(&self, store: &dyn CapabilityStore) -> anyhow::Result<()> {
        self.normalizer.ensure(store).await
    }
}
