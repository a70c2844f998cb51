use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use modelmux_common::UpstreamId;

/// Per-upstream in-flight request counters, kept for a future
/// least-connections strategy. Purely in-process.
#[derive(Default)]
pub struct ConnectionCounters {
    counters: RwLock<HashMap<UpstreamId, Arc<AtomicU64>>>,
}

impl ConnectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, upstream_id: &UpstreamId) -> Arc<AtomicU64> {
        if let Some(counter) = self
            .counters
            .read()
            .expect("counter lock poisoned")
            .get(upstream_id)
        {
            return counter.clone();
        }
        let mut guard = self.counters.write().expect("counter lock poisoned");
        guard
            .entry(*upstream_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn acquire(&self, upstream_id: &UpstreamId) {
        self.counter(upstream_id).fetch_add(1, Ordering::Relaxed);
    }

    /// Release one in-flight slot. Saturates at zero; a release without a
    /// matching acquire must never wrap.
    pub fn release(&self, upstream_id: &UpstreamId) {
        let counter = self.counter(upstream_id);
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            current.checked_sub(1)
        });
    }

    pub fn in_flight(&self, upstream_id: &UpstreamId) -> u64 {
        self.counter(upstream_id).load(Ordering::Relaxed)
    }
}

/// Per-group rotating cursor, kept for legacy group selection. Provider-type
/// tiered routing does not consult it.
#[derive(Default)]
pub struct RoundRobinCursors {
    cursors: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl RoundRobinCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self, group: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cursor = {
            if let Some(cursor) = self
                .cursors
                .read()
                .expect("cursor lock poisoned")
                .get(group)
            {
                cursor.clone()
            } else {
                let mut guard = self.cursors.write().expect("cursor lock poisoned");
                guard
                    .entry(group.to_string())
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                    .clone()
            }
        };
        cursor.fetch_add(1, Ordering::Relaxed) % len
    }
}
