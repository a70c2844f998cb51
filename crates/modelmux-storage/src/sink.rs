use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use modelmux_routing::{
    CircuitState, CircuitTransitionRecord, HealthUpdateRecord, PersistedCircuitState,
    RoutingDecision, RoutingStateEvent, StateSink,
};

use crate::storage::{HealthPatch, RequestLogInsert, Storage, StorageResult};

/// Bridges the routing core's state events onto the store. Failures are
/// logged and dropped; the in-process state remains authoritative and the
/// next event overwrites the row anyway.
pub struct StorageStateSink {
    storage: Arc<dyn Storage>,
}

impl StorageStateSink {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    async fn persist(&self, event: &RoutingStateEvent) -> StorageResult<()> {
        match event {
            RoutingStateEvent::CircuitTransition(record) => {
                self.persist_circuit(record).await
            }
            RoutingStateEvent::HealthUpdate(record) => self.persist_health(record).await,
            RoutingStateEvent::Decision(decision) => self.persist_decision(decision).await,
        }
    }

    async fn persist_circuit(&self, record: &CircuitTransitionRecord) -> StorageResult<()> {
        let state = PersistedCircuitState {
            state: record.to,
            failure_count: record.failure_count,
            success_count: record.success_count,
            opened_at: (record.to == CircuitState::Open).then_some(record.at),
            last_failure_at: (record.to == CircuitState::Open).then_some(record.at),
            config_override: None,
        };
        self.storage.circuit_set(record.upstream_id, &state).await
    }

    async fn persist_health(&self, record: &HealthUpdateRecord) -> StorageResult<()> {
        let patch = HealthPatch {
            healthy: Some(record.healthy),
            failure_count: Some(record.failure_count),
            latency_ms: record.latency_ms,
            last_error: Some(record.error.clone()),
            last_check_at: Some(record.at),
            last_success_at: record.healthy.then_some(record.at),
        };
        self.storage.health_update(record.upstream_id, patch).await
    }

    async fn persist_decision(&self, decision: &RoutingDecision) -> StorageResult<()> {
        let row = RequestLogInsert {
            upstream_id: decision.selected_upstream_id,
            at: time::OffsetDateTime::now_utc(),
            provider_type: decision.provider_type,
            model: Some(decision.resolved_model.clone()),
            session_id: decision.session_id.clone(),
            response_status: None,
            latency_ms: None,
            decision: Some(serde_json::to_value(decision)?),
        };
        self.storage.append_request_log(row).await.map(|_| ())
    }
}

#[async_trait]
impl StateSink for StorageStateSink {
    async fn submit(&self, event: RoutingStateEvent) {
        if let Err(error) = self.persist(&event).await {
            warn!(event = "state_sink_write_failed", error = %error);
        }
    }
}
