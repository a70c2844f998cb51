use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

use modelmux_common::{ProviderType, Upstream, UpstreamId};

/// Sentinel for "no latency observation yet".
const NO_OBSERVATION: u64 = u64::MAX;

/// One candidate as the selector sees it: the upstream row plus the latency
/// hint merged onto it. The hint is the only runtime observation that rides
/// along; the rest of the health record stays with the health tracker.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub upstream: Arc<Upstream>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct Row {
    upstream: Arc<Upstream>,
    latency: Arc<AtomicU64>,
}

impl Row {
    fn new(upstream: Arc<Upstream>) -> Self {
        Self {
            upstream,
            latency: Arc::new(AtomicU64::new(NO_OBSERVATION)),
        }
    }

    fn candidate(&self) -> CandidateRow {
        let raw = self.latency.load(Ordering::Relaxed);
        CandidateRow {
            upstream: Arc::clone(&self.upstream),
            latency_ms: (raw != NO_OBSERVATION).then_some(raw),
        }
    }
}

/// Immutable view of the active upstream set at one point in time. Latency
/// cells are shared with the live catalog, so an observation recorded after
/// the snapshot was taken is still visible through it.
#[derive(Debug)]
pub struct CatalogSnapshot {
    rows: Arc<Vec<Row>>,
}

impl CatalogSnapshot {
    fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Arc::new(rows),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn candidates(&self) -> Vec<CandidateRow> {
        self.rows.iter().map(Row::candidate).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read-mostly catalog of active upstreams. Selection loads the snapshot
/// lock-free; admin mutations rebuild it. Rows with `active == false` never
/// enter a snapshot, which is what soft-delete means here.
pub struct UpstreamCatalog {
    snapshot: ArcSwap<CatalogSnapshot>,
}

impl Default for UpstreamCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamCatalog {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::new(Arc::new(CatalogSnapshot::empty())),
        }
    }

    pub fn replace_snapshot(&self, upstreams: Vec<Upstream>) {
        let rows = upstreams
            .into_iter()
            .filter(|upstream| upstream.active)
            .map(|upstream| Row::new(Arc::new(upstream)))
            .collect();
        self.snapshot.store(Arc::new(CatalogSnapshot::new(rows)));
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.load_full()
    }

    /// Insert or replace one row. An inactive row removes any existing
    /// entry; a replaced row keeps its latency observation.
    pub fn upsert(&self, upstream: Upstream) {
        let upstream = Arc::new(upstream);
        self.snapshot.rcu(|current| {
            let existing_latency = current
                .rows
                .iter()
                .find(|row| row.upstream.id == upstream.id)
                .map(|row| Arc::clone(&row.latency));
            let mut next: Vec<Row> = current
                .rows
                .iter()
                .filter(|row| row.upstream.id != upstream.id)
                .cloned()
                .collect();
            if upstream.active {
                next.push(Row {
                    upstream: Arc::clone(&upstream),
                    latency: existing_latency
                        .unwrap_or_else(|| Arc::new(AtomicU64::new(NO_OBSERVATION))),
                });
            }
            Arc::new(CatalogSnapshot::new(next))
        });
    }

    pub fn remove(&self, upstream_id: &UpstreamId) {
        self.snapshot.rcu(|current| {
            let next: Vec<Row> = current
                .rows
                .iter()
                .filter(|row| row.upstream.id != *upstream_id)
                .cloned()
                .collect();
            Arc::new(CatalogSnapshot::new(next))
        });
    }

    /// Merge a latency observation onto the row. Unknown ids are ignored
    /// (the upstream may have been removed while the request was in flight).
    pub fn record_latency(&self, upstream_id: &UpstreamId, latency_ms: u64) {
        let latency_ms = latency_ms.min(NO_OBSERVATION - 1);
        if let Some(row) = self
            .snapshot
            .load()
            .rows
            .iter()
            .find(|row| row.upstream.id == *upstream_id)
        {
            row.latency.store(latency_ms, Ordering::Relaxed);
        }
    }

    pub fn find(&self, upstream_id: &UpstreamId) -> Option<Arc<Upstream>> {
        self.snapshot
            .load()
            .rows
            .iter()
            .find(|row| row.upstream.id == *upstream_id)
            .map(|row| Arc::clone(&row.upstream))
    }

    pub fn contains(&self, upstream_id: &UpstreamId) -> bool {
        self.find(upstream_id).is_some()
    }

    pub fn by_provider_type(&self, provider_type: ProviderType) -> Vec<CandidateRow> {
        self.snapshot
            .load()
            .rows
            .iter()
            .filter(|row| row.upstream.provider_type == provider_type)
            .map(Row::candidate)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
