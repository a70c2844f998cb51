use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use modelmux_common::{RouteCapability, UpstreamId, canonicalize_capabilities};

/// The slice of the store the normalizer needs: raw persisted capability
/// arrays and an idempotent write-back.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    async fn list_route_capabilities(&self) -> anyhow::Result<Vec<(UpstreamId, Vec<String>)>>;
    async fn update_route_capabilities(
        &self,
        upstream_id: UpstreamId,
        capabilities: &[RouteCapability],
    ) -> anyhow::Result<()>;
}

/// One-shot background reconciliation of persisted route-capability arrays:
/// trim, drop unknown tokens, dedupe, sort canonically, and write back only
/// rows whose stored value differs.
///
/// Concurrent triggers coalesce on the run lock; only a completed pass marks
/// the migration done, so a failed pass is retried by the next trigger.
pub struct CapabilityNormalizer {
    done: AtomicBool,
    running: Mutex<()>,
}

impl Default for CapabilityNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityNormalizer {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            running: Mutex::new(()),
        }
    }

    pub async fn ensure(&self, store: &dyn CapabilityStore) -> anyhow::Result<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.running.lock().await;
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }

        let rows = store.list_route_capabilities().await?;
        let mut rewritten = 0usize;
        for (upstream_id, raw) in rows {
            let canonical = canonicalize_capabilities(&raw);
            if !matches_canonical(&raw, &canonical) {
                if let Err(error) = store
                    .update_route_capabilities(upstream_id, &canonical)
                    .await
                {
                    warn!(
                        event = "capability_normalize_failed",
                        upstream = %upstream_id,
                        error = %error,
                    );
                    return Err(error);
                }
                rewritten += 1;
            }
        }

        self.done.store(true, Ordering::Release);
        if rewritten > 0 {
            info!(event = "capability_normalize", rewritten = rewritten);
        }
        Ok(())
    }
}

fn matches_canonical(raw: &[String], canonical: &[RouteCapability]) -> bool {
    raw.len() == canonical.len()
        && raw
            .iter()
            .zip(canonical)
            .all(|(token, capability)| token == capability.as_str())
}
