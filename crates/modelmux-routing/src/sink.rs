use async_trait::async_trait;
use time::OffsetDateTime;

use modelmux_common::UpstreamId;

use crate::breaker::CircuitState;
use crate::decision::RoutingDecision;

/// Wall-clock record of one circuit transition, as handed to persistence.
#[derive(Debug, Clone)]
pub struct CircuitTransitionRecord {
    pub upstream_id: UpstreamId,
    pub from: CircuitState,
    pub to: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct HealthUpdateRecord {
    pub upstream_id: UpstreamId,
    pub healthy: bool,
    pub failure_count: u32,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub enum RoutingStateEvent {
    CircuitTransition(CircuitTransitionRecord),
    HealthUpdate(HealthUpdateRecord),
    Decision(Box<RoutingDecision>),
}

/// Persistence boundary for in-process routing state. Submissions are
/// fire-and-forget from the core's point of view; a backend that needs
/// ordering serializes internally.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn submit(&self, event: RoutingStateEvent);
}

pub struct NoopStateSink;

#[async_trait]
impl StateSink for NoopStateSink {
    async fn submit(&self, _event: RoutingStateEvent) {}
}
