use std::sync::Arc;

use tracing::debug;

use modelmux_common::UpstreamId;

use crate::adapter::UsageTokens;
use crate::affinity::AffinityStore;
use crate::breaker::{CircuitBreaker, FailureKind};
use crate::catalog::UpstreamCatalog;
use crate::counters::ConnectionCounters;
use crate::health::HealthTracker;
use crate::selector::AffinityContext;

/// How a forwarded request terminated, as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A terminal HTTP status arrived from the upstream.
    Status(u16),
    /// The request never produced a status: timeout, connect failure.
    Transport(FailureKind),
    /// The client went away after selection.
    Cancelled,
}

/// Post-response glue: exactly one report per selected upstream feeds the
/// circuit breaker, the health record, the catalog's latency hint, and the
/// in-flight counter. Token accounting arrives separately because it is
/// parsed from the response body, which may stream in after the status.
pub struct OutcomeReporter {
    breaker: Arc<CircuitBreaker>,
    affinity: Arc<AffinityStore>,
    health: Arc<HealthTracker>,
    catalog: Arc<UpstreamCatalog>,
    counters: Arc<ConnectionCounters>,
}

impl OutcomeReporter {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        affinity: Arc<AffinityStore>,
        health: Arc<HealthTracker>,
        catalog: Arc<UpstreamCatalog>,
        counters: Arc<ConnectionCounters>,
    ) -> Self {
        Self {
            breaker,
            affinity,
            health,
            catalog,
            counters,
        }
    }

    pub async fn report(&self, upstream_id: &UpstreamId, outcome: RequestOutcome, latency_ms: u64) {
        self.counters.release(upstream_id);
        match outcome {
            RequestOutcome::Status(status) if (200..300).contains(&status) => {
                self.breaker.record_success(upstream_id).await;
                self.health.record_success(upstream_id, latency_ms).await;
                self.catalog.record_latency(upstream_id, latency_ms);
            }
            RequestOutcome::Status(429) => {
                self.breaker
                    .record_failure(upstream_id, FailureKind::RateLimited)
                    .await;
                self.health.record_failure(upstream_id, "http 429").await;
            }
            RequestOutcome::Status(status) if status >= 500 => {
                self.breaker
                    .record_failure(upstream_id, FailureKind::ServerError)
                    .await;
                self.health
                    .record_failure(upstream_id, format!("http {status}"))
                    .await;
            }
            // Client errors are transport-level, not upstream-health
            // signals; 3xx is not expected from any supported provider.
            RequestOutcome::Status(status) => {
                debug!(
                    event = "outcome_neutral",
                    upstream = %upstream_id,
                    status = status,
                );
            }
            RequestOutcome::Transport(kind) => {
                self.breaker.record_failure(upstream_id, kind).await;
                self.health
                    .record_failure(upstream_id, format!("{kind:?}"))
                    .await;
            }
            RequestOutcome::Cancelled => {
                self.breaker
                    .record_failure(upstream_id, FailureKind::Cancelled)
                    .await;
            }
        }
    }

    /// Fold observed token usage (cache reads included) into the session's
    /// cumulative accounting.
    pub fn report_usage(&self, ctx: &AffinityContext, usage: &UsageTokens) {
        self.affinity.add_input_tokens(
            &ctx.api_key_id,
            ctx.scope.as_str(),
            &ctx.session_id,
            usage.total_input(),
        );
    }
}
