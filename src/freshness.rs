//! Freshness policy (component H).
//!
//! Decides, for a given mirror and incoming `want` set, whether to serve
//! directly from the mirror, trigger a background-ineligible refresh before
//! serving, force a refresh because a wanted oid is missing, or fall back to
//! stale data because upstream is unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessDecision {
    /// Mirror is fresh enough (or upstream is disabled); serve as-is.
    ServeCached,
    /// Mirror is stale by time but a want could still be satisfiable;
    /// refresh first, then serve.
    Refresh,
    /// A wanted oid is absent from the mirror; refresh is mandatory
    /// regardless of freshness window.
    ForceRefresh,
}

pub struct FreshnessPolicy {
    pub window: Duration,
    upstream_enabled: AtomicBool,
}

impl FreshnessPolicy {
    pub fn new(window: Duration) -> Self {
        FreshnessPolicy {
            window,
            upstream_enabled: AtomicBool::new(true),
        }
    }

    pub fn set_upstream_enabled(&self, enabled: bool) {
        self.upstream_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Read once per request; the captured value is used for the whole
    /// request's lifetime rather than re-checked mid-flight.
    pub fn upstream_enabled(&self) -> bool {
        self.upstream_enabled.load(Ordering::SeqCst)
    }

    pub fn decide(
        &self,
        last_update_utc: chrono::DateTime<chrono::Utc>,
        missing_want: bool,
    ) -> FreshnessDecision {
        if missing_want {
            return FreshnessDecision::ForceRefresh;
        }
        if !self.upstream_enabled() {
            return FreshnessDecision::ServeCached;
        }
        if self.is_fresh(last_update_utc) {
            FreshnessDecision::ServeCached
        } else {
            FreshnessDecision::Refresh
        }
    }

    /// Compares two wall-clock timestamps; never mixed with a monotonic
    /// `Instant` reading.
    pub fn is_fresh(&self, last_update_utc: chrono::DateTime<chrono::Utc>) -> bool {
        let age = chrono::Utc::now().signed_duration_since(last_update_utc);
        match age.to_std() {
            Ok(age) => age < self.window,
            Err(_) => false,
        }
    }
}
