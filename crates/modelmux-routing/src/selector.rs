use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use modelmux_common::{ProviderType, RouteCapability, SelectorConfig, Upstream, UpstreamId};

use crate::affinity::{AffinityStore, evaluate_migration};
use crate::breaker::CircuitBreaker;
use crate::catalog::{CandidateRow, UpstreamCatalog};
use crate::counters::ConnectionCounters;
use crate::decision::{CandidateRecord, ExcludedCandidate, ExclusionReason, RoutingDecision};
use crate::quota::QuotaTracker;
use crate::resolver::{Resolution, resolve};
use crate::sink::{RoutingStateEvent, StateSink};

/// Session identity of the request, when the transport managed to extract
/// one. All fields must be present for affinity to engage.
#[derive(Debug, Clone)]
pub struct AffinityContext {
    pub api_key_id: String,
    pub session_id: String,
    pub scope: RouteCapability,
    pub content_length: u64,
}

#[derive(Debug, Clone)]
pub struct SelectInput {
    pub provider_type: ProviderType,
    pub model: String,
    /// Failover: upstreams that already failed this request.
    pub exclude_ids: Vec<UpstreamId>,
    /// Per-key authorization; a non-empty list intersects the candidate set.
    pub allowed_upstream_ids: Option<Vec<UpstreamId>>,
    pub affinity: Option<AffinityContext>,
}

impl SelectInput {
    pub fn new(provider_type: ProviderType, model: impl Into<String>) -> Self {
        Self {
            provider_type,
            model: model.into(),
            exclude_ids: Vec::new(),
            allowed_upstream_ids: None,
            affinity: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectedUpstream {
    pub upstream: Arc<Upstream>,
    pub resolved_model: String,
    pub model_redirect_applied: bool,
    pub selected_tier: u32,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub decision: RoutingDecision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExhaustionCounts {
    pub circuit_open: u32,
    pub model_not_allowed: u32,
    pub quota_exceeded: u32,
    pub excluded_by_failover: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no active upstream for provider type {0}")]
    NoAvailableUpstream(ProviderType),
    #[error("no authorized upstream for provider type {0}")]
    NoAuthorizedUpstream(ProviderType),
    #[error("no healthy upstream for provider type {provider_type}")]
    NoHealthyUpstream {
        provider_type: ProviderType,
        counts: ExhaustionCounts,
    },
}

/// Tiered weighted selection over the upstream catalog, merged with circuit
/// state, quota verdicts, and session affinity.
pub struct UpstreamSelector {
    catalog: Arc<UpstreamCatalog>,
    breaker: Arc<CircuitBreaker>,
    affinity: Arc<AffinityStore>,
    quota: Arc<dyn QuotaTracker>,
    counters: Arc<ConnectionCounters>,
    sink: Arc<dyn StateSink>,
    config: SelectorConfig,
}

impl UpstreamSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<UpstreamCatalog>,
        breaker: Arc<CircuitBreaker>,
        affinity: Arc<AffinityStore>,
        quota: Arc<dyn QuotaTracker>,
        counters: Arc<ConnectionCounters>,
        sink: Arc<dyn StateSink>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            catalog,
            breaker,
            affinity,
            quota,
            counters,
            sink,
            config,
        }
    }

    pub async fn select(&self, input: &SelectInput) -> Result<SelectedUpstream, SelectError> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        self.select_with_rng(input, &mut rng).await
    }

    /// Selection with a caller-owned RNG so distribution tests can seed it.
    pub async fn select_with_rng<R: Rng + ?Sized>(
        &self,
        input: &SelectInput,
        rng: &mut R,
    ) -> Result<SelectedUpstream, SelectError> {
        let fetched = self.catalog.by_provider_type(input.provider_type);
        if fetched.is_empty() {
            return Err(SelectError::NoAvailableUpstream(input.provider_type));
        }

        let considered: Vec<CandidateRow> = match &input.allowed_upstream_ids {
            Some(allowed) if !allowed.is_empty() => fetched
                .into_iter()
                .filter(|row| allowed.contains(&row.upstream.id))
                .collect(),
            _ => fetched,
        };
        if considered.is_empty() {
            return Err(SelectError::NoAuthorizedUpstream(input.provider_type));
        }

        let candidates: Vec<CandidateRecord> = considered
            .iter()
            .map(|row| CandidateRecord {
                id: row.upstream.id,
                name: row.upstream.name.clone(),
                weight: row.upstream.weight,
                circuit_state: self.breaker.state_of(&row.upstream.id),
            })
            .collect();

        let mut counts = ExhaustionCounts::default();
        let mut excluded: Vec<ExcludedCandidate> = Vec::new();

        // Model allow-lists and failover exclusions apply to every path,
        // affinity included.
        let mut eligible: Vec<CandidateRow> = Vec::new();
        for row in considered.iter() {
            let resolution = resolve_for(&input.model, &row.upstream);
            if !row.upstream.allows_model(&resolution.model) {
                counts.model_not_allowed += 1;
                excluded.push(exclusion(&row.upstream, ExclusionReason::ModelNotAllowed));
                continue;
            }
            if input.exclude_ids.contains(&row.upstream.id) {
                counts.excluded_by_failover += 1;
                excluded.push(exclusion(&row.upstream, ExclusionReason::ExcludedByFailover));
                continue;
            }
            eligible.push(row.clone());
        }

        if let Some(ctx) = &input.affinity
            && let Some(outcome) = self.try_affinity(ctx, &eligible).await
        {
            return Ok(self.finish(
                input,
                Some(ctx.session_id.clone()),
                outcome.upstream,
                outcome.migrated,
                true,
                candidates,
                excluded,
                counts,
                0,
                eligible.len() as u32,
            )
            .await);
        }

        // Tiered selection: strictly tier by tier, weighted random inside a
        // tier, permit after the draw. A refused candidate leaves the tier's
        // remaining set, which bounds the retry loop at the tier size.
        let mut tiers: BTreeMap<u32, Vec<CandidateRow>> = BTreeMap::new();
        for row in &eligible {
            tiers
                .entry(row.upstream.priority)
                .or_default()
                .push(row.clone());
        }

        let mut tier_exhausted = 0u32;
        let mut selection: Option<(Arc<Upstream>, u32)> = None;

        'tiers: for (priority, tier) in tiers {
            let mut remaining: Vec<CandidateRow> = Vec::new();
            for row in tier {
                if !self.breaker.is_admissible(&row.upstream.id) {
                    counts.circuit_open += 1;
                    excluded.push(exclusion(&row.upstream, ExclusionReason::CircuitOpen));
                    continue;
                }
                if row.upstream.quota.is_some() && self.quota.is_exhausted(&row.upstream) {
                    counts.quota_exceeded += 1;
                    excluded.push(exclusion(&row.upstream, ExclusionReason::QuotaExceeded));
                    continue;
                }
                remaining.push(row);
            }

            while !remaining.is_empty() {
                let weights: Vec<f64> = remaining
                    .iter()
                    .map(|row| {
                        f64::from(row.upstream.weight)
                            * latency_score(row.latency_ms, &self.config)
                    })
                    .collect();
                let index = pick_weighted_index(&weights, rng);
                let candidate = remaining.swap_remove(index);
                match self.breaker.acquire_permit(&candidate.upstream.id).await {
                    Ok(()) => {
                        selection = Some((candidate.upstream, priority));
                        break 'tiers;
                    }
                    Err(_) => {
                        counts.circuit_open += 1;
                        excluded.push(exclusion(&candidate.upstream, ExclusionReason::CircuitOpen));
                    }
                }
            }
            tier_exhausted += 1;
        }

        let Some((upstream, tier)) = selection else {
            warn!(
                event = "selection_exhausted",
                provider = %input.provider_type,
                model = %input.model,
                circuit_open = counts.circuit_open,
                model_not_allowed = counts.model_not_allowed,
                quota_exceeded = counts.quota_exceeded,
                excluded_by_failover = counts.excluded_by_failover,
            );
            return Err(SelectError::NoHealthyUpstream {
                provider_type: input.provider_type,
                counts,
            });
        };

        // First sighting of a session on this route: bind it to the chosen
        // upstream. A live binding that merely failed its permit above is
        // left untouched (that fallback is request-local).
        if let Some(ctx) = &input.affinity
            && self
                .affinity
                .get(&ctx.api_key_id, ctx.scope.as_str(), &ctx.session_id)
                .is_none()
        {
            self.affinity.set(
                &ctx.api_key_id,
                ctx.scope.as_str(),
                &ctx.session_id,
                upstream.id,
                ctx.content_length,
            );
        }

        let session_id = input.affinity.as_ref().map(|ctx| ctx.session_id.clone());
        let final_count = eligible.len() as u32 - counts.circuit_open - counts.quota_exceeded;
        Ok(self
            .finish(
                input,
                session_id,
                (upstream, tier),
                false,
                false,
                candidates,
                excluded,
                counts,
                tier_exhausted,
                final_count,
            )
            .await)
    }

    /// Affinity short-circuit: honor a live binding whose upstream is still
    /// eligible and whose circuit admits traffic, migrating it to a higher
    /// tier when the session is still cheap to move.
    async fn try_affinity(
        &self,
        ctx: &AffinityContext,
        eligible: &[CandidateRow],
    ) -> Option<AffinityOutcome> {
        let entry = self
            .affinity
            .get(&ctx.api_key_id, ctx.scope.as_str(), &ctx.session_id)?;
        let bound = eligible
            .iter()
            .find(|row| row.upstream.id == entry.upstream_id)
            .map(|row| Arc::clone(&row.upstream))?;
        self.breaker.acquire_permit(&bound.id).await.ok()?;

        let pool: Vec<Arc<Upstream>> = eligible
            .iter()
            .map(|row| Arc::clone(&row.upstream))
            .collect();
        if let Some(target) =
            evaluate_migration(&bound, &pool, ctx.content_length, entry.input_tokens)
            && self.breaker.acquire_permit(&target.id).await.is_ok()
        {
            self.affinity.set(
                &ctx.api_key_id,
                ctx.scope.as_str(),
                &ctx.session_id,
                target.id,
                ctx.content_length,
            );
            let tier = target.priority;
            return Some(AffinityOutcome {
                upstream: (target, tier),
                migrated: true,
            });
        }

        let tier = bound.priority;
        Some(AffinityOutcome {
            upstream: (bound, tier),
            migrated: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        input: &SelectInput,
        session_id: Option<String>,
        selection: (Arc<Upstream>, u32),
        affinity_migrated: bool,
        affinity_hit: bool,
        candidates: Vec<CandidateRecord>,
        excluded: Vec<ExcludedCandidate>,
        counts: ExhaustionCounts,
        tier_exhausted: u32,
        final_candidate_count: u32,
    ) -> SelectedUpstream {
        let (upstream, tier) = selection;
        let resolution = resolve_for(&input.model, &upstream);
        self.counters.acquire(&upstream.id);

        let decision = RoutingDecision {
            original_model: input.model.clone(),
            resolved_model: resolution.model.clone(),
            model_redirect_applied: resolution.redirected,
            provider_type: input.provider_type,
            selected_upstream_id: upstream.id,
            selected_upstream_name: upstream.name.clone(),
            selected_tier: tier,
            candidate_count: candidates.len() as u32,
            final_candidate_count,
            candidates,
            excluded,
            tier_exhausted_count: tier_exhausted,
            affinity_hit,
            affinity_migrated,
            session_id,
        };

        info!(
            event = "upstream_selected",
            provider = %input.provider_type,
            upstream = %upstream.name,
            tier = tier,
            model = %resolution.model,
            affinity_hit = affinity_hit,
            affinity_migrated = affinity_migrated,
            circuit_filtered = counts.circuit_open,
        );
        self.sink
            .submit(RoutingStateEvent::Decision(Box::new(decision.clone())))
            .await;

        SelectedUpstream {
            upstream,
            resolved_model: resolution.model,
            model_redirect_applied: resolution.redirected,
            selected_tier: tier,
            affinity_hit,
            affinity_migrated,
            decision,
        }
    }
}

struct AffinityOutcome {
    upstream: (Arc<Upstream>, u32),
    migrated: bool,
}

fn exclusion(upstream: &Upstream, reason: ExclusionReason) -> ExcludedCandidate {
    ExcludedCandidate {
        id: upstream.id,
        name: upstream.name.clone(),
        reason,
    }
}

fn resolve_for(model: &str, upstream: &Upstream) -> Resolution {
    match &upstream.model_redirects {
        Some(redirects) => resolve(model, redirects),
        None => Resolution {
            model: model.to_string(),
            redirected: false,
        },
    }
}

/// Weight each candidate down by how slow it has recently been. The score
/// lives in [0.1, 1.0]; an unknown latency scores a neutral 1.0.
fn latency_score(latency_ms: Option<u64>, config: &SelectorConfig) -> f64 {
    match latency_ms {
        Some(ms) => {
            let penalty = (ms as f64 / config.latency_penalty_denominator_ms as f64)
                .min(config.latency_penalty_cap);
            (1.0 - penalty).max(0.1)
        }
        None => 1.0,
    }
}

/// Weighted draw over effective weights; an all-zero tier degenerates to a
/// uniform pick.
fn pick_weighted_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return rng.random_range(0..weights.len());
    }
    let mut roll = rng.random_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if roll < *weight {
            return index;
        }
        roll -= weight;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use modelmux_common::SelectorConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{latency_score, pick_weighted_index};

    #[test]
    fn latency_score_is_clamped() {
        let config = SelectorConfig::default();
        assert_eq!(latency_score(None, &config), 1.0);
        assert_eq!(latency_score(Some(0), &config), 1.0);
        // 250ms of 500ms denominator penalizes half of the cap.
        assert_eq!(latency_score(Some(250), &config), 0.5);
        // The cap holds no matter how slow the upstream was.
        assert_eq!(latency_score(Some(10_000), &config), 0.5);

        let harsh = SelectorConfig {
            latency_penalty_cap: 1.0,
            ..config
        };
        assert_eq!(latency_score(Some(10_000), &harsh), 0.1);
    }

    #[test]
    fn zero_total_weight_degenerates_to_uniform() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = [0.0, 0.0, 0.0];
        let mut seen = [0u32; 3];
        for _ in 0..300 {
            seen[pick_weighted_index(&weights, &mut rng)] += 1;
        }
        assert!(seen.iter().all(|count| *count > 50));
    }

    #[test]
    fn draw_respects_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = [10.0, 1.0];
        let mut heavy = 0u32;
        for _ in 0..1_000 {
            if pick_weighted_index(&weights, &mut rng) == 0 {
                heavy += 1;
            }
        }
        assert!((850..=950).contains(&heavy), "heavy picked {heavy} times");
    }

    #[test]
    fn single_candidate_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pick_weighted_index(&[42.0], &mut rng), 0);
    }
}
