use serde::Serialize;

use modelmux_common::{ProviderType, UpstreamId};

use crate::breaker::CircuitState;

/// Why a candidate was dropped from consideration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    CircuitOpen,
    ModelNotAllowed,
    QuotaExceeded,
    ExcludedByFailover,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub id: UpstreamId,
    pub name: String,
    pub weight: u32,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedCandidate {
    pub id: UpstreamId,
    pub name: String,
    pub reason: ExclusionReason,
}

/// The record of one routing choice, consumed by the request log. Immutable
/// once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub original_model: String,
    pub resolved_model: String,
    pub model_redirect_applied: bool,
    pub provider_type: ProviderType,
    pub selected_upstream_id: UpstreamId,
    pub selected_upstream_name: String,
    pub selected_tier: u32,
    pub candidate_count: u32,
    pub final_candidate_count: u32,
    pub candidates: Vec<CandidateRecord>,
    pub excluded: Vec<ExcludedCandidate>,
    pub tier_exhausted_count: u32,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub session_id: Option<String>,
}
