use modelmux_common::Upstream;

/// Verdict source for spending caps. Billing computation lives outside the
/// core; the selector only asks whether an upstream's quota is spent.
/// Upstreams without a quota policy are never asked.
///
/// Sync by design: the check runs inside the selector's filter loop, which
/// must not suspend.
pub trait QuotaTracker: Send + Sync {
    fn is_exhausted(&self, upstream: &Upstream) -> bool;
}

/// Default tracker for deployments without spend enforcement.
pub struct NoopQuotaTracker;

impl QuotaTracker for NoopQuotaTracker {
    fn is_exhausted(&self, _upstream: &Upstream) -> bool {
        false
    }
}
