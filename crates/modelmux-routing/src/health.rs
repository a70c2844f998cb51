use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use modelmux_common::UpstreamId;

use crate::sink::{HealthUpdateRecord, RoutingStateEvent, StateSink};

/// Operator-facing record of the last observed outcome per upstream.
/// Display only: the selector never reads this. The latency it scores with
/// travels separately, merged onto the catalog row by the outcome reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub last_check_at: Option<OffsetDateTime>,
    pub last_success_at: Option<OffsetDateTime>,
    pub failure_count: u32,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Shape of the operator dashboard aggregation over the request-log store.
/// The core defines this response; executing the query is the store's job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyAggregate {
    pub sample_count: u64,
    /// Fraction of sampled requests that terminated 2xx.
    pub availability: f64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

pub struct HealthTracker {
    records: RwLock<HashMap<UpstreamId, HealthRecord>>,
    sink: Arc<dyn StateSink>,
}

impl HealthTracker {
    pub fn new(sink: Arc<dyn StateSink>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sink,
        }
    }

    pub fn seed(&self, upstream_id: &UpstreamId, record: HealthRecord) {
        self.records
            .write()
            .expect("health lock poisoned")
            .insert(*upstream_id, record);
    }

    pub async fn record_success(&self, upstream_id: &UpstreamId, latency_ms: u64) {
        let now = OffsetDateTime::now_utc();
        {
            let mut guard = self.records.write().expect("health lock poisoned");
            let record = guard.entry(*upstream_id).or_default();
            record.healthy = true;
            record.last_check_at = Some(now);
            record.last_success_at = Some(now);
            record.failure_count = 0;
            record.latency_ms = Some(latency_ms);
            record.last_error = None;
        }
        self.emit(upstream_id, true, 0, Some(latency_ms), None, now)
            .await;
    }

    pub async fn record_failure(&self, upstream_id: &UpstreamId, error: impl Into<String>) {
        let now = OffsetDateTime::now_utc();
        let error = error.into();
        let failure_count = {
            let mut guard = self.records.write().expect("health lock poisoned");
            let record = guard.entry(*upstream_id).or_default();
            record.healthy = false;
            record.last_check_at = Some(now);
            record.failure_count = record.failure_count.saturating_add(1);
            record.last_error = Some(error.clone());
            record.failure_count
        };
        self.emit(upstream_id, false, failure_count, None, Some(error), now)
            .await;
    }

    pub fn get(&self, upstream_id: &UpstreamId) -> Option<HealthRecord> {
        self.records
            .read()
            .expect("health lock poisoned")
            .get(upstream_id)
            .cloned()
    }

    async fn emit(
        &self,
        upstream_id: &UpstreamId,
        healthy: bool,
        failure_count: u32,
        latency_ms: Option<u64>,
        error: Option<String>,
        at: OffsetDateTime,
    ) {
        self.sink
            .submit(RoutingStateEvent::HealthUpdate(HealthUpdateRecord {
                upstream_id: *upstream_id,
                healthy,
                failure_count,
                latency_ms,
                error,
                at,
            }))
            .await;
    }
}
