use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::RouteCapability;
use crate::config::CircuitBreakerOverride;
use crate::provider::ProviderType;

pub type UpstreamId = Uuid;

/// Which conversation dimension a migration policy compares against its
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMetric {
    Tokens,
    Length,
}

/// Opt-in policy allowing sessions bound to a lower-rank upstream to move
/// here while the conversation is still cheap to re-cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MigrationPolicy {
    pub enabled: bool,
    pub metric: MigrationMetric,
    pub threshold: u64,
}

/// Spending cap consulted by the quota tracker. Billing math lives outside
/// the core; the selector only sees the tracker's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub limit_usd: f64,
}

/// A registered backend instance. Mutated only through the admin path;
/// soft-deleted by clearing `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub id: UpstreamId,
    pub name: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    /// Encrypted at rest; the core never decrypts it.
    pub api_key_encrypted: String,
    pub active: bool,
    pub weight: u32,
    /// Lower value = higher rank.
    pub priority: u32,
    pub route_capabilities: Vec<RouteCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_redirects: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_override: Option<CircuitBreakerOverride>,
}

impl Upstream {
    pub fn migration_enabled(&self) -> bool {
        self.migration.map(|m| m.enabled).unwrap_or(false)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(list) => list.iter().any(|m| m == model),
            None => true,
        }
    }

    pub fn has_capability(&self, capability: RouteCapability) -> bool {
        self.route_capabilities.contains(&capability)
    }
}
