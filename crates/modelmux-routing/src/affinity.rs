use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;

use modelmux_common::{AffinityConfig, MigrationMetric, Upstream, UpstreamId};

/// Opaque map key: SHA-256 of `apiKeyId:scope:sessionId`. Collision
/// resistance is the only property required of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityKey([u8; 32]);

impl AffinityKey {
    pub fn derive(api_key_id: &str, scope: &str, session_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(api_key_id.as_bytes());
        hasher.update(b":");
        hasher.update(scope.as_bytes());
        hasher.update(b":");
        hasher.update(session_id.as_bytes());
        Self(hasher.finalize().into())
    }
}

/// View of a binding as returned to the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityEntry {
    pub upstream_id: UpstreamId,
    pub content_length: u64,
    pub input_tokens: u64,
}

#[derive(Debug, Clone, Copy)]
struct EntryInner {
    upstream_id: UpstreamId,
    created_at: Instant,
    last_accessed_at: Instant,
    content_length: u64,
    input_tokens: u64,
}

/// In-memory session → upstream binding store for prompt-cache reuse.
///
/// Entries expire on a sliding TTL from the last access and an absolute TTL
/// from creation; expired entries read as absent and a periodic sweep reaps
/// them. Overflow beyond capacity evicts the least-recently-accessed entry.
pub struct AffinityStore {
    config: AffinityConfig,
    entries: Mutex<HashMap<AffinityKey, EntryInner>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl AffinityStore {
    pub fn new(config: AffinityConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            sweep: Mutex::new(None),
        }
    }

    fn is_expired(&self, entry: &EntryInner, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_accessed_at) > self.config.sliding_ttl()
            || now.saturating_duration_since(entry.created_at) > self.config.max_ttl()
    }

    /// Look up a binding, refreshing its sliding window on a hit.
    pub fn get(&self, api_key_id: &str, scope: &str, session_id: &str) -> Option<AffinityEntry> {
        self.get_at(
            AffinityKey::derive(api_key_id, scope, session_id),
            Instant::now(),
        )
    }

    fn get_at(&self, key: AffinityKey, now: Instant) -> Option<AffinityEntry> {
        let mut guard = self.entries.lock().expect("affinity lock poisoned");
        let entry = guard.get_mut(&key)?;
        if now.saturating_duration_since(entry.last_accessed_at) > self.config.sliding_ttl()
            || now.saturating_duration_since(entry.created_at) > self.config.max_ttl()
        {
            guard.remove(&key);
            return None;
        }
        entry.last_accessed_at = now;
        Some(AffinityEntry {
            upstream_id: entry.upstream_id,
            content_length: entry.content_length,
            input_tokens: entry.input_tokens,
        })
    }

    /// Create or refresh a binding. An existing live entry keeps its birth
    /// time and cumulative tokens; the bound upstream and content length are
    /// replaced. Callers must only bind upstreams that exist in the catalog.
    pub fn set(
        &self,
        api_key_id: &str,
        scope: &str,
        session_id: &str,
        upstream_id: UpstreamId,
        content_length: u64,
    ) {
        self.set_at(
            AffinityKey::derive(api_key_id, scope, session_id),
            upstream_id,
            content_length,
            Instant::now(),
        );
    }

    fn set_at(&self, key: AffinityKey, upstream_id: UpstreamId, content_length: u64, now: Instant) {
        let mut guard = self.entries.lock().expect("affinity lock poisoned");
        let refreshed = match guard.get_mut(&key) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry.upstream_id = upstream_id;
                entry.content_length = content_length;
                entry.last_accessed_at = now;
                true
            }
            _ => false,
        };
        if !refreshed {
            guard.insert(
                key,
                EntryInner {
                    upstream_id,
                    created_at: now,
                    last_accessed_at: now,
                    content_length,
                    input_tokens: 0,
                },
            );
        }

        while guard.len() > self.config.capacity {
            let Some(oldest) = guard
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed_at)
                .map(|(key, _)| *key)
            else {
                break;
            };
            guard.remove(&oldest);
        }
    }

    /// Accumulate observed input tokens (cache reads included) onto a live
    /// binding, refreshing its sliding window.
    pub fn add_input_tokens(&self, api_key_id: &str, scope: &str, session_id: &str, tokens: u64) {
        self.add_input_tokens_at(
            AffinityKey::derive(api_key_id, scope, session_id),
            tokens,
            Instant::now(),
        );
    }

    fn add_input_tokens_at(&self, key: AffinityKey, tokens: u64, now: Instant) {
        let mut guard = self.entries.lock().expect("affinity lock poisoned");
        let Some(entry) = guard.get_mut(&key) else {
            return;
        };
        if self.is_expired(entry, now) {
            guard.remove(&key);
            return;
        }
        entry.input_tokens = entry.input_tokens.saturating_add(tokens);
        entry.last_accessed_at = now;
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("affinity lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("affinity lock poisoned").clear();
    }

    fn sweep_expired(&self, now: Instant) -> usize {
        let mut guard = self.entries.lock().expect("affinity lock poisoned");
        let before = guard.len();
        guard.retain(|_, entry| {
            now.saturating_duration_since(entry.last_accessed_at) <= self.config.sliding_ttl()
                && now.saturating_duration_since(entry.created_at) <= self.config.max_ttl()
        });
        before - guard.len()
    }

    /// Start the periodic reaper. Idempotent; a second call is a no-op.
    pub fn spawn_sweep_task(self: &Arc<Self>) {
        let mut slot = self.sweep.lock().expect("affinity sweep lock poisoned");
        if slot.is_some() {
            return;
        }
        let store = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = store.sweep_expired(Instant::now());
                if reaped > 0 {
                    debug!(event = "affinity_sweep", reaped = reaped);
                }
            }
        }));
    }

    /// Stop the reaper and drop all bindings.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .sweep
            .lock()
            .expect("affinity sweep lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.clear();
    }
}

impl Drop for AffinityStore {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweep.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

/// Decide whether a bound session should move to a higher-rank upstream.
///
/// Only candidates strictly above the current upstream's rank with migration
/// enabled are considered; the best-ranked one's policy decides. Migration is
/// worthwhile only while the conversation is still small enough that
/// re-establishing the prompt cache is cheap, so the compared quantity must
/// be strictly below the policy threshold.
pub fn evaluate_migration(
    current: &Upstream,
    candidates: &[Arc<Upstream>],
    content_length: u64,
    cumulative_tokens: u64,
) -> Option<Arc<Upstream>> {
    let target = candidates
        .iter()
        .filter(|candidate| candidate.priority < current.priority)
        .filter(|candidate| candidate.migration_enabled())
        .min_by_key(|candidate| candidate.priority)?;

    let policy = target.migration?;
    let compared = match policy.metric {
        MigrationMetric::Tokens => cumulative_tokens,
        MigrationMetric::Length => {
            if content_length == 0 {
                return None;
            }
            content_length
        }
    };

    (compared < policy.threshold).then(|| Arc::clone(target))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use modelmux_common::{
        AffinityConfig, MigrationMetric, MigrationPolicy, ProviderType, Upstream,
    };
    use uuid::Uuid;

    use super::{AffinityKey, AffinityStore, evaluate_migration};

    fn store() -> AffinityStore {
        AffinityStore::new(AffinityConfig::default())
    }

    fn upstream(priority: u32, migration: Option<MigrationPolicy>) -> Upstream {
        Upstream {
            id: Uuid::now_v7(),
            name: format!("tier-{priority}"),
            provider_type: ProviderType::Openai,
            base_url: "https://api.example.test".to_string(),
            api_key_encrypted: "enc:".to_string(),
            active: true,
            weight: 1,
            priority,
            route_capabilities: vec![],
            allowed_models: None,
            model_redirects: None,
            migration,
            quota: None,
            breaker_override: None,
        }
    }

    #[test]
    fn set_then_get_returns_binding() {
        let store = store();
        let upstream_id = Uuid::now_v7();
        store.set("key1", "openai_chat_compatible", "s1", upstream_id, 42);
        let entry = store
            .get("key1", "openai_chat_compatible", "s1")
            .expect("binding present");
        assert_eq!(entry.upstream_id, upstream_id);
        assert_eq!(entry.content_length, 42);
        assert_eq!(entry.input_tokens, 0);
    }

    #[test]
    fn distinct_tuples_do_not_collide() {
        let store = store();
        store.set("key1", "scope", "s1", Uuid::now_v7(), 1);
        assert!(store.get("key2", "scope", "s1").is_none());
        assert!(store.get("key1", "scope", "s2").is_none());
        assert!(store.get("key1", "other", "s1").is_none());
    }

    #[test]
    fn sliding_ttl_expires_idle_entries() {
        let store = store();
        let key = AffinityKey::derive("k", "scope", "s");
        let t0 = Instant::now();
        store.set_at(key, Uuid::now_v7(), 10, t0);

        let idle = t0 + store.config.sliding_ttl() + Duration::from_secs(1);
        assert!(store.get_at(key, idle).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn access_refreshes_sliding_window() {
        let store = store();
        let key = AffinityKey::derive("k", "scope", "s");
        let t0 = Instant::now();
        store.set_at(key, Uuid::now_v7(), 10, t0);

        let almost = t0 + store.config.sliding_ttl() - Duration::from_secs(1);
        assert!(store.get_at(key, almost).is_some());

        let after_refresh = almost + store.config.sliding_ttl() - Duration::from_secs(1);
        assert!(store.get_at(key, after_refresh).is_some());
    }

    #[test]
    fn max_ttl_expires_even_under_constant_access() {
        let store = store();
        let key = AffinityKey::derive("k", "scope", "s");
        let t0 = Instant::now();
        store.set_at(key, Uuid::now_v7(), 10, t0);

        let mut now = t0;
        while now < t0 + store.config.max_ttl() {
            assert!(store.get_at(key, now).is_some());
            now += Duration::from_secs(60);
        }
        assert!(store.get_at(key, t0 + store.config.max_ttl() + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn set_preserves_birth_and_tokens() {
        let store = store();
        let key = AffinityKey::derive("k", "scope", "s");
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let t0 = Instant::now();

        store.set_at(key, first, 10, t0);
        store.add_input_tokens_at(key, 500, t0 + Duration::from_secs(1));
        store.set_at(key, second, 99, t0 + Duration::from_secs(2));

        let entry = store.get_at(key, t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(entry.upstream_id, second);
        assert_eq!(entry.input_tokens, 500);
        assert_eq!(entry.content_length, 99);

        // Birth time survived the rebind, so the absolute TTL still counts
        // from t0.
        assert!(
            store
                .get_at(key, t0 + store.config.max_ttl() + Duration::from_secs(5))
                .is_none()
        );
    }

    #[test]
    fn overflow_evicts_least_recently_accessed() {
        let store = AffinityStore::new(AffinityConfig {
            capacity: 2,
            ..Default::default()
        });
        let t0 = Instant::now();
        let cold = AffinityKey::derive("k", "scope", "cold");
        let warm = AffinityKey::derive("k", "scope", "warm");
        let fresh = AffinityKey::derive("k", "scope", "fresh");

        store.set_at(cold, Uuid::now_v7(), 1, t0);
        store.set_at(warm, Uuid::now_v7(), 1, t0 + Duration::from_secs(1));
        store.get_at(cold, t0 + Duration::from_secs(2));
        store.set_at(fresh, Uuid::now_v7(), 1, t0 + Duration::from_secs(3));

        assert_eq!(store.len(), 2);
        assert!(store.get_at(warm, t0 + Duration::from_secs(4)).is_none());
        assert!(store.get_at(cold, t0 + Duration::from_secs(4)).is_some());
        assert!(store.get_at(fresh, t0 + Duration::from_secs(4)).is_some());
    }

    #[test]
    fn sweep_reaps_expired_entries() {
        let store = store();
        let t0 = Instant::now();
        for i in 0..4 {
            let key = AffinityKey::derive("k", "scope", &format!("s{i}"));
            store.set_at(key, Uuid::now_v7(), 1, t0);
        }
        let reaped = store.sweep_expired(t0 + store.config.sliding_ttl() + Duration::from_secs(1));
        assert_eq!(reaped, 4);
        assert!(store.is_empty());
    }

    #[test]
    fn migration_ignores_lower_rank_and_disabled_candidates() {
        let policy = MigrationPolicy {
            enabled: true,
            metric: MigrationMetric::Tokens,
            threshold: 50_000,
        };
        let current = upstream(1, None);
        let lower = Arc::new(upstream(2, Some(policy)));
        let disabled = Arc::new(upstream(
            0,
            Some(MigrationPolicy {
                enabled: false,
                ..policy
            }),
        ));
        assert!(evaluate_migration(&current, &[lower, disabled], 100, 1_000).is_none());
    }

    #[test]
    fn migration_moves_small_sessions_up() {
        let policy = MigrationPolicy {
            enabled: true,
            metric: MigrationMetric::Tokens,
            threshold: 50_000,
        };
        let current = upstream(1, None);
        let tier0 = Arc::new(upstream(0, Some(policy)));

        let target = evaluate_migration(&current, &[Arc::clone(&tier0)], 100, 1_000).unwrap();
        assert_eq!(target.id, tier0.id);
        assert!(target.priority < current.priority);

        assert!(evaluate_migration(&current, &[tier0], 100, 50_000).is_none());
    }

    #[test]
    fn length_metric_requires_positive_content_length() {
        let policy = MigrationPolicy {
            enabled: true,
            metric: MigrationMetric::Length,
            threshold: 4_096,
        };
        let current = upstream(1, None);
        let tier0 = Arc::new(upstream(0, Some(policy)));

        assert!(evaluate_migration(&current, &[Arc::clone(&tier0)], 0, 0).is_none());
        assert!(evaluate_migration(&current, &[Arc::clone(&tier0)], 4_096, 0).is_none());
        assert!(evaluate_migration(&current, &[tier0], 1_024, 0).is_some());
    }

    #[test]
    fn migration_prefers_best_rank_among_eligible() {
        let policy = MigrationPolicy {
            enabled: true,
            metric: MigrationMetric::Tokens,
            threshold: 50_000,
        };
        let current = upstream(3, None);
        let tier1 = Arc::new(upstream(1, Some(policy)));
        let tier2 = Arc::new(upstream(2, Some(policy)));

        let target =
            evaluate_migration(&current, &[Arc::clone(&tier2), Arc::clone(&tier1)], 0, 10).unwrap();
        assert_eq!(target.id, tier1.id);
    }
}
