use async_trait::async_trait;
use time::OffsetDateTime;

use modelmux_common::{ProviderType, RouteCapability, Upstream, UpstreamId};
use modelmux_routing::{
    CircuitState, HealthRecord, LatencyAggregate, PersistedCircuitState, RoutingSnapshot,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// An upstream row joined with its breaker and health state, as the selector
/// path consumes it when rebuilding a catalog snapshot.
#[derive(Debug, Clone)]
pub struct UpstreamWithState {
    pub upstream: Upstream,
    pub circuit: Option<PersistedCircuitState>,
    pub health: Option<HealthRecord>,
}

/// Expected previous value for a conditional circuit transition; the update
/// applies only when both still match.
#[derive(Debug, Clone, Copy)]
pub struct CircuitExpectation {
    pub state: CircuitState,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HealthPatch {
    pub healthy: Option<bool>,
    pub failure_count: Option<u32>,
    pub latency_ms: Option<u64>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<String>>,
    pub last_check_at: Option<OffsetDateTime>,
    pub last_success_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct RequestLogInsert {
    pub upstream_id: UpstreamId,
    pub at: OffsetDateTime,
    pub provider_type: ProviderType,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub response_status: Option<i32>,
    pub latency_ms: Option<i64>,
    pub decision: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateWindow {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
}

/// Store operations the routing core consumes. Runtime selection never calls
/// into here; it reads in-memory snapshots seeded by `load_snapshot` and kept
/// fresh through the admin path and the state sink.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Enabled by default at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<RoutingSnapshot>;

    // Upstreams
    async fn upsert_upstream(&self, upstream: &Upstream) -> StorageResult<()>;
    async fn set_upstream_active(&self, upstream_id: UpstreamId, active: bool)
    -> StorageResult<()>;
    async fn find_upstreams_by_provider_type(
        &self,
        provider_type: ProviderType,
    ) -> StorageResult<Vec<UpstreamWithState>>;
    async fn update_route_capabilities(
        &self,
        upstream_id: UpstreamId,
        capabilities: &[RouteCapability],
    ) -> StorageResult<()>;

    // Circuit breaker state
    async fn circuit_get(
        &self,
        upstream_id: UpstreamId,
    ) -> StorageResult<Option<PersistedCircuitState>>;
    /// Compare-and-swap transition. Returns false when the expectation no
    /// longer holds (or, for a creation, when the row already exists).
    async fn circuit_upsert_conditional(
        &self,
        upstream_id: UpstreamId,
        expected: Option<CircuitExpectation>,
        next: &PersistedCircuitState,
    ) -> StorageResult<bool>;
    /// Unconditional write, for admin overrides and the state sink.
    async fn circuit_set(
        &self,
        upstream_id: UpstreamId,
        state: &PersistedCircuitState,
    ) -> StorageResult<()>;

    // Health
    async fn health_update(&self, upstream_id: UpstreamId, patch: HealthPatch)
    -> StorageResult<()>;
    async fn health_get(&self, upstream_id: UpstreamId) -> StorageResult<Option<HealthRecord>>;

    // Request log
    async fn append_request_log(&self, row: RequestLogInsert) -> StorageResult<i64>;
    /// Availability and latency percentiles over one upstream's request log.
    /// PostgreSQL computes exact continuous percentiles; SQLite and MySQL use
    /// a sorted-offset approximation.
    async fn aggregate_request_logs(
        &self,
        upstream_id: UpstreamId,
        window: AggregateWindow,
    ) -> StorageResult<LatencyAggregate>;
}
