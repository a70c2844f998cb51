use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use modelmux_common::{CircuitBreakerConfig, CircuitBreakerOverride, UpstreamId};

use crate::sink::{CircuitTransitionRecord, RoutingStateEvent, StateSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an upstream attempt was counted as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connect,
    RateLimited,
    ServerError,
    Cancelled,
    Other,
}

/// Signaling condition: the upstream may not serve a request right now.
/// Converted into a candidate exclusion by the selector; never surfaced to
/// the end client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open, retry in {}s", .remaining.as_secs())]
pub struct CircuitOpen {
    pub remaining: Duration,
}

/// Point-in-time observation of one upstream's breaker.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_remaining_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<OffsetDateTime>,
}

/// Wall-clock form of a breaker entry, as stored and reloaded at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCircuitState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_override: Option<CircuitBreakerOverride>,
}

#[derive(Debug)]
struct Entry {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_probe_at: Option<Instant>,
    last_failure_at: Option<OffsetDateTime>,
    config: CircuitBreakerConfig,
}

impl Entry {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_probe_at: None,
            last_failure_at: None,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    failure_count: u32,
    success_count: u32,
}

/// Per-upstream failure-driven state machine. Entries are created lazily on
/// first reference and removed only by an explicit admin `reset`.
///
/// Every transition and every permit admission runs under the upstream's own
/// mutex, with no suspension point inside the critical section; the sink
/// submission happens after the guard is dropped.
pub struct CircuitBreaker {
    defaults: CircuitBreakerConfig,
    entries: RwLock<HashMap<UpstreamId, Arc<Mutex<Entry>>>>,
    sink: Arc<dyn StateSink>,
}

impl CircuitBreaker {
    pub fn new(defaults: CircuitBreakerConfig, sink: Arc<dyn StateSink>) -> Self {
        Self {
            defaults,
            entries: RwLock::new(HashMap::new()),
            sink,
        }
    }

    fn entry(&self, upstream_id: &UpstreamId) -> Arc<Mutex<Entry>> {
        if let Some(entry) = self
            .entries
            .read()
            .expect("breaker index lock poisoned")
            .get(upstream_id)
        {
            return entry.clone();
        }
        let mut guard = self.entries.write().expect("breaker index lock poisoned");
        guard
            .entry(*upstream_id)
            .or_insert_with(|| Arc::new(Mutex::new(Entry::new(self.defaults))))
            .clone()
    }

    /// Apply (or clear) an upstream's breaker override. Called whenever the
    /// catalog row changes.
    pub fn configure(&self, upstream_id: &UpstreamId, over: Option<CircuitBreakerOverride>) {
        let entry = self.entry(upstream_id);
        let mut guard = entry.lock().expect("breaker entry lock poisoned");
        guard.config = match over {
            Some(over) => over.merged_over(&self.defaults),
            None => self.defaults,
        };
    }

    /// Seed one entry from its persisted form at bootstrap.
    pub fn seed(&self, upstream_id: &UpstreamId, persisted: &PersistedCircuitState) {
        let config = persisted
            .config_override
            .map(|over| over.merged_over(&self.defaults))
            .unwrap_or(self.defaults);

        let opened_at = if persisted.state == CircuitState::Open {
            let elapsed = persisted
                .opened_at
                .map(|at| {
                    Duration::try_from(OffsetDateTime::now_utc() - at).unwrap_or(Duration::ZERO)
                })
                .unwrap_or(Duration::ZERO);
            Some(
                Instant::now()
                    .checked_sub(elapsed)
                    .unwrap_or_else(Instant::now),
            )
        } else {
            None
        };

        let entry = self.entry(upstream_id);
        let mut guard = entry.lock().expect("breaker entry lock poisoned");
        *guard = Entry {
            state: persisted.state,
            failure_count: persisted.failure_count,
            success_count: persisted.success_count,
            opened_at,
            last_probe_at: None,
            last_failure_at: persisted.last_failure_at,
            config,
        };
    }

    /// Admit or refuse a request for the upstream. Open circuits flip to
    /// half-open once the open duration has elapsed, admitting the caller as
    /// the probe; half-open circuits admit at most one probe per probe
    /// interval.
    pub async fn acquire_permit(&self, upstream_id: &UpstreamId) -> Result<(), CircuitOpen> {
        let (result, transition) = self.acquire_permit_at(upstream_id, Instant::now());
        if let Some(transition) = transition {
            self.emit(upstream_id, transition).await;
        }
        result
    }

    fn acquire_permit_at(
        &self,
        upstream_id: &UpstreamId,
        now: Instant,
    ) -> (Result<(), CircuitOpen>, Option<Transition>) {
        let entry = self.entry(upstream_id);
        let mut guard = entry.lock().expect("breaker entry lock poisoned");
        match guard.state {
            CircuitState::Closed => (Ok(()), None),
            CircuitState::Open => {
                let opened_at = guard.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                let open_duration = guard.config.open_duration();
                if elapsed < open_duration {
                    return (
                        Err(CircuitOpen {
                            remaining: open_duration - elapsed,
                        }),
                        None,
                    );
                }
                let from = guard.state;
                guard.state = CircuitState::HalfOpen;
                guard.success_count = 0;
                guard.opened_at = None;
                guard.last_probe_at = Some(now);
                let transition = Transition {
                    from,
                    to: CircuitState::HalfOpen,
                    failure_count: guard.failure_count,
                    success_count: guard.success_count,
                };
                (Ok(()), Some(transition))
            }
            CircuitState::HalfOpen => {
                let probe_interval = guard.config.probe_interval();
                if let Some(last) = guard.last_probe_at {
                    let since = now.saturating_duration_since(last);
                    if since < probe_interval {
                        return (
                            Err(CircuitOpen {
                                remaining: probe_interval - since,
                            }),
                            None,
                        );
                    }
                }
                guard.last_probe_at = Some(now);
                (Ok(()), None)
            }
        }
    }

    /// Read-only admissibility peek used by the selector's tier pre-filter.
    /// Does not consume a probe slot; the authoritative check is
    /// `acquire_permit` after the weighted draw.
    pub fn is_admissible(&self, upstream_id: &UpstreamId) -> bool {
        let entry = self.entry(upstream_id);
        let guard = entry.lock().expect("breaker entry lock poisoned");
        let now = Instant::now();
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => match guard.opened_at {
                Some(opened_at) => {
                    now.saturating_duration_since(opened_at) >= guard.config.open_duration()
                }
                None => true,
            },
            CircuitState::HalfOpen => match guard.last_probe_at {
                Some(last) => {
                    now.saturating_duration_since(last) >= guard.config.probe_interval()
                }
                None => true,
            },
        }
    }

    pub async fn record_success(&self, upstream_id: &UpstreamId) {
        if let Some(transition) = self.record_success_at(upstream_id) {
            self.emit(upstream_id, transition).await;
        }
    }

    fn record_success_at(&self, upstream_id: &UpstreamId) -> Option<Transition> {
        let entry = self.entry(upstream_id);
        let mut guard = entry.lock().expect("breaker entry lock poisoned");
        match guard.state {
            // No-op while closed: the failure count accumulates until the
            // threshold opens the circuit or an admin resets it.
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count < guard.config.success_threshold {
                    return None;
                }
                let from = guard.state;
                guard.state = CircuitState::Closed;
                guard.failure_count = 0;
                guard.success_count = 0;
                guard.opened_at = None;
                guard.last_probe_at = None;
                Some(Transition {
                    from,
                    to: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                })
            }
            // A request admitted before the circuit opened finished late;
            // its result no longer says anything about recovery.
            CircuitState::Open => None,
        }
    }

    pub async fn record_failure(&self, upstream_id: &UpstreamId, kind: FailureKind) {
        let transition = self.record_failure_at(upstream_id, Instant::now());
        if let Some(transition) = transition {
            warn!(
                event = "circuit_failure",
                upstream = %upstream_id,
                kind = ?kind,
                state = transition.to.as_str(),
                failures = transition.failure_count,
            );
            self.emit(upstream_id, transition).await;
        }
    }

    fn record_failure_at(&self, upstream_id: &UpstreamId, now: Instant) -> Option<Transition> {
        let entry = self.entry(upstream_id);
        let mut guard = entry.lock().expect("breaker entry lock poisoned");
        let at = OffsetDateTime::now_utc();
        match guard.state {
            CircuitState::Closed => {
                guard.failure_count += 1;
                guard.last_failure_at = Some(at);
                if guard.failure_count < guard.config.failure_threshold {
                    return None;
                }
                let from = guard.state;
                guard.state = CircuitState::Open;
                guard.opened_at = Some(now);
                Some(Transition {
                    from,
                    to: CircuitState::Open,
                    failure_count: guard.failure_count,
                    success_count: guard.success_count,
                })
            }
            CircuitState::HalfOpen => {
                let from = guard.state;
                guard.state = CircuitState::Open;
                guard.opened_at = Some(now);
                guard.success_count = 0;
                guard.last_failure_at = Some(at);
                Some(Transition {
                    from,
                    to: CircuitState::Open,
                    failure_count: guard.failure_count,
                    success_count: 0,
                })
            }
            CircuitState::Open => {
                guard.last_failure_at = Some(at);
                None
            }
        }
    }

    pub async fn force_open(&self, upstream_id: &UpstreamId) {
        let entry = self.entry(upstream_id);
        let transition = {
            let mut guard = entry.lock().expect("breaker entry lock poisoned");
            if guard.state == CircuitState::Open {
                None
            } else {
                let from = guard.state;
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                guard.success_count = 0;
                Some(Transition {
                    from,
                    to: CircuitState::Open,
                    failure_count: guard.failure_count,
                    success_count: 0,
                })
            }
        };
        if let Some(transition) = transition {
            self.emit(upstream_id, transition).await;
        }
    }

    pub async fn force_close(&self, upstream_id: &UpstreamId) {
        let entry = self.entry(upstream_id);
        let transition = {
            let mut guard = entry.lock().expect("breaker entry lock poisoned");
            if guard.state == CircuitState::Closed && guard.failure_count == 0 {
                None
            } else {
                let from = guard.state;
                guard.state = CircuitState::Closed;
                guard.failure_count = 0;
                guard.success_count = 0;
                guard.opened_at = None;
                guard.last_probe_at = None;
                Some(Transition {
                    from,
                    to: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                })
            }
        };
        if let Some(transition) = transition {
            self.emit(upstream_id, transition).await;
        }
    }

    /// Admin reset: drop the entry entirely. The next reference recreates a
    /// fresh closed breaker with default (or re-applied) config.
    pub fn reset(&self, upstream_id: &UpstreamId) {
        self.entries
            .write()
            .expect("breaker index lock poisoned")
            .remove(upstream_id);
        info!(event = "circuit_reset", upstream = %upstream_id);
    }

    pub fn state_of(&self, upstream_id: &UpstreamId) -> CircuitState {
        let entry = self.entry(upstream_id);
        let guard = entry.lock().expect("breaker entry lock poisoned");
        guard.state
    }

    pub fn snapshot_of(&self, upstream_id: &UpstreamId) -> CircuitSnapshot {
        let entry = self.entry(upstream_id);
        let guard = entry.lock().expect("breaker entry lock poisoned");
        let open_remaining_seconds = guard.opened_at.map(|opened_at| {
            guard
                .config
                .open_duration()
                .saturating_sub(opened_at.elapsed())
                .as_secs()
        });
        CircuitSnapshot {
            state: guard.state,
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            open_remaining_seconds,
            last_failure_at: guard.last_failure_at,
        }
    }

    async fn emit(&self, upstream_id: &UpstreamId, transition: Transition) {
        info!(
            event = "circuit_transition",
            upstream = %upstream_id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
        );
        self.sink
            .submit(RoutingStateEvent::CircuitTransition(
                CircuitTransitionRecord {
                    upstream_id: *upstream_id,
                    from: transition.from,
                    to: transition.to,
                    failure_count: transition.failure_count,
                    success_count: transition.success_count,
                    at: OffsetDateTime::now_utc(),
                },
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use modelmux_common::{CircuitBreakerConfig, CircuitBreakerOverride};
    use uuid::Uuid;

    use super::{CircuitBreaker, CircuitState, FailureKind};
    use crate::sink::NoopStateSink;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default(), Arc::new(NoopStateSink))
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        for _ in 0..4 {
            breaker.record_failure_at(&id, Instant::now());
            assert_eq!(breaker.state_of(&id), CircuitState::Closed);
        }
        breaker.record_failure_at(&id, Instant::now());
        assert_eq!(breaker.state_of(&id), CircuitState::Open);

        let snapshot = breaker.snapshot_of(&id);
        assert_eq!(snapshot.failure_count, 5);
        assert!(snapshot.open_remaining_seconds.is_some());
    }

    #[test]
    fn open_blocks_until_duration_elapses() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        let t0 = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(&id, t0);
        }

        let (blocked, _) = breaker.acquire_permit_at(&id, t0 + Duration::from_secs(1));
        let err = blocked.unwrap_err();
        assert!(err.remaining <= Duration::from_secs(29));

        let (admitted, transition) = breaker.acquire_permit_at(&id, t0 + Duration::from_secs(31));
        assert!(admitted.is_ok());
        assert_eq!(transition.unwrap().to, CircuitState::HalfOpen);
        assert_eq!(breaker.state_of(&id), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_one_probe_per_interval() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        let t0 = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(&id, t0);
        }
        let probe_time = t0 + Duration::from_secs(31);
        assert!(breaker.acquire_permit_at(&id, probe_time).0.is_ok());
        assert!(breaker.acquire_permit_at(&id, probe_time).0.is_err());
        assert!(
            breaker
                .acquire_permit_at(&id, probe_time + Duration::from_secs(9))
                .0
                .is_err()
        );
        assert!(
            breaker
                .acquire_permit_at(&id, probe_time + Duration::from_secs(10))
                .0
                .is_ok()
        );
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        let t0 = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(&id, t0);
        }
        breaker
            .acquire_permit_at(&id, t0 + Duration::from_secs(31))
            .0
            .unwrap();

        assert!(breaker.record_success_at(&id).is_none());
        assert_eq!(breaker.state_of(&id), CircuitState::HalfOpen);

        let transition = breaker.record_success_at(&id).unwrap();
        assert_eq!(transition.to, CircuitState::Closed);

        let snapshot = breaker.snapshot_of(&id);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert!(snapshot.open_remaining_seconds.is_none());
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        let t0 = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(&id, t0);
        }
        breaker
            .acquire_permit_at(&id, t0 + Duration::from_secs(31))
            .0
            .unwrap();
        breaker.record_success_at(&id);

        let transition = breaker
            .record_failure_at(&id, t0 + Duration::from_secs(32))
            .unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(transition.success_count, 0);
        assert!(
            breaker
                .acquire_permit_at(&id, t0 + Duration::from_secs(33))
                .0
                .is_err()
        );
    }

    #[test]
    fn closed_success_is_a_noop() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        for _ in 0..4 {
            breaker.record_failure_at(&id, Instant::now());
        }
        breaker.record_success_at(&id);
        assert_eq!(breaker.snapshot_of(&id).failure_count, 4);

        // The fifth cumulative failure still opens the circuit.
        breaker.record_failure_at(&id, Instant::now());
        assert_eq!(breaker.state_of(&id), CircuitState::Open);
    }

    #[test]
    fn override_changes_threshold() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        breaker.configure(
            &id,
            Some(CircuitBreakerOverride {
                failure_threshold: Some(2),
                ..Default::default()
            }),
        );
        breaker.record_failure_at(&id, Instant::now());
        assert_eq!(breaker.state_of(&id), CircuitState::Closed);
        breaker.record_failure_at(&id, Instant::now());
        assert_eq!(breaker.state_of(&id), CircuitState::Open);
    }

    #[tokio::test]
    async fn force_open_and_close() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        breaker.force_open(&id).await;
        assert_eq!(breaker.state_of(&id), CircuitState::Open);
        assert!(breaker.acquire_permit(&id).await.is_err());

        breaker.force_close(&id).await;
        assert_eq!(breaker.state_of(&id), CircuitState::Closed);
        assert!(breaker.acquire_permit(&id).await.is_ok());
    }

    #[tokio::test]
    async fn reset_recreates_fresh_entry() {
        let breaker = breaker();
        let id = Uuid::now_v7();
        for _ in 0..5 {
            breaker.record_failure(&id, FailureKind::ServerError).await;
        }
        assert_eq!(breaker.state_of(&id), CircuitState::Open);
        breaker.reset(&id);
        assert_eq!(breaker.state_of(&id), CircuitState::Closed);
        assert!(breaker.acquire_permit(&id).await.is_ok());
    }
}
