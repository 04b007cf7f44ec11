//! Shared application state: bundles the collaborators (mirror registry,
//! upstream client, single-flight coordinator, freshness policy, event bus)
//! the HTTP handlers need, and the refresh orchestration that ties them
//! together. Grounded on the teacher's `AppState`/`HttpGitHandler` wiring in
//! `examples/http_server.rs`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::auth::{AuthenticationService, PassthroughAuth};
use crate::canonical::{DefaultCanonicalizer, RepositoryId, UrlCanonicalizer};
use crate::error::GobletError;
use crate::events::{CacheOutcome, Event, EventBus, EventKind};
use crate::fingerprint::Fingerprint;
use crate::freshness::{FreshnessDecision, FreshnessPolicy};
use crate::mirror::{MirrorHandle, MirrorRef, MirrorStore};
use crate::singleflight::{RepoLocks, SingleFlight};
use crate::upstream::{GitUpstreamClient, UpstreamClient, UpstreamRef};

/// Fixed bucket bounds (seconds) for `goblet_request_duration_seconds`,
/// matching Prometheus client library defaults since the corpus has no
/// metrics crate of its own to borrow bucket choices from.
pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Hand-rolled histogram: per-bucket counts are stored non-cumulatively and
/// summed at render time, since that's simpler to keep correct under
/// concurrent `observe` calls than maintaining running cumulative atomics.
#[derive(Default)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Histogram {
            buckets: (0..=DURATION_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        let idx = DURATION_BUCKETS
            .iter()
            .position(|&bound| seconds <= bound)
            .unwrap_or(DURATION_BUCKETS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative count for each of `DURATION_BUCKETS`, in order (the `+Inf`
    /// bucket is `count()`, not included here).
    pub fn cumulative_bucket_counts(&self) -> Vec<u64> {
        let mut running = 0u64;
        let mut out = Vec::with_capacity(DURATION_BUCKETS.len());
        for bucket in &self.buckets[..DURATION_BUCKETS.len()] {
            running += bucket.load(Ordering::Relaxed);
            out.push(running);
        }
        out
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Counters/histograms backing `/metrics`, named and labeled per spec §6:
/// `goblet_requests_total{command,outcome}`, `goblet_bytes_out_total`,
/// `goblet_upstream_errors_total{kind}`, `goblet_fallback_stale_total`,
/// `goblet_request_duration_seconds{command}` (histogram). The inflight/repo
/// gauges live on `SingleFlight`/`MirrorStore` themselves and are read
/// directly by `http::metrics`.
#[derive(Default)]
pub struct Counters {
    requests_total: DashMap<(&'static str, &'static str), AtomicU64, ahash::RandomState>,
    upstream_errors_total: DashMap<&'static str, AtomicU64, ahash::RandomState>,
    fallback_stale_total: AtomicU64,
    bytes_out_total: AtomicU64,
    request_duration: DashMap<&'static str, Histogram, ahash::RandomState>,
}

impl Counters {
    pub(crate) fn record_request(&self, command: &'static str, outcome: &'static str) {
        self.requests_total
            .entry((command, outcome))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_error(&self, kind: &'static str) {
        self.upstream_errors_total
            .entry(kind)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback_stale(&self) {
        self.fallback_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_out_total(&self) -> u64 {
        self.bytes_out_total.load(Ordering::Relaxed)
    }

    pub fn fallback_stale_total(&self) -> u64 {
        self.fallback_stale_total.load(Ordering::Relaxed)
    }

    pub fn observe_duration(&self, command: &'static str, duration: Duration) {
        self.request_duration
            .entry(command)
            .or_insert_with(Histogram::new)
            .observe(duration);
    }

    pub fn requests_iter(&self) -> Vec<((&'static str, &'static str), u64)> {
        self.requests_total
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn upstream_errors_iter(&self) -> Vec<(&'static str, u64)> {
        self.upstream_errors_total
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn duration_histograms(&self) -> Vec<(&'static str, Vec<u64>, f64, u64)> {
        self.request_duration
            .iter()
            .map(|entry| {
                let histogram = entry.value();
                (
                    *entry.key(),
                    histogram.cumulative_bucket_counts(),
                    histogram.sum_seconds(),
                    histogram.count(),
                )
            })
            .collect()
    }
}

pub struct AppState {
    pub mirrors: MirrorStore,
    pub upstream: Arc<dyn UpstreamClient>,
    pub canonicalizer: Arc<dyn UrlCanonicalizer>,
    pub auth: Arc<dyn AuthenticationService>,
    pub repo_locks: RepoLocks,
    pub refresh_flight: SingleFlight<()>,
    pub freshness: FreshnessPolicy,
    pub events: EventBus,
    pub counters: Counters,
    /// Total deadline for a request up to its first response byte; enforced
    /// by the HTTP handlers around mirror resolution, not by `AppState`
    /// itself (see `http::routes`).
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        cache_root: std::path::PathBuf,
        upstream_timeout: Duration,
        freshness_window: Duration,
        event_queue_capacity: usize,
        request_timeout: Duration,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<Event>) {
        let (events, receiver) = EventBus::new(event_queue_capacity);
        let state = Arc::new(AppState {
            mirrors: MirrorStore::new(cache_root),
            upstream: Arc::new(GitUpstreamClient::new(upstream_timeout)),
            canonicalizer: Arc::new(DefaultCanonicalizer),
            auth: Arc::new(PassthroughAuth),
            repo_locks: RepoLocks::new(),
            refresh_flight: SingleFlight::new(),
            counters: Counters::default(),
            freshness: FreshnessPolicy::new(freshness_window),
            events,
            request_timeout,
        });
        (state, receiver)
    }

    /// Resolves an origin URL into an open mirror, refreshing it first if
    /// the freshness policy calls for it. Implements the state machine's
    /// `FreshnessDecided -> {Serving|Refreshing}` transition plus the
    /// stale-fallback failure semantics of spec §4.H.
    pub async fn resolve_fresh_mirror(
        &self,
        origin_url: &str,
        missing_want: bool,
        fingerprint: Fingerprint,
        credentials: &HashMap<String, String>,
        command: &'static str,
    ) -> Result<Arc<MirrorHandle>, GobletError> {
        let repo_id = self.canonicalizer.canonicalize(origin_url).await?;
        let handle = self.mirrors.open_or_create(&repo_id).await?;
        let metadata = handle.metadata.read().await.clone();

        let decision = self.freshness.decide(metadata.last_update_utc, missing_want);
        match decision {
            FreshnessDecision::ServeCached => {
                self.counters.record_request(command, "hit");
                self.publish(
                    &repo_id,
                    Some(fingerprint),
                    EventKind::CacheHit,
                    CacheOutcome::Hit,
                    None,
                );
                Ok(handle)
            }
            FreshnessDecision::Refresh | FreshnessDecision::ForceRefresh => {
                match self.refresh(&repo_id, origin_url, &handle, credentials).await {
                    Ok(()) => {
                        self.counters.record_request(command, "miss_refreshed");
                        self.publish(
                            &repo_id,
                            Some(fingerprint),
                            EventKind::CacheMiss,
                            CacheOutcome::MissRefreshed,
                            None,
                        );
                        Ok(handle)
                    }
                    Err(err) => {
                        let outcome = err.upstream_outcome();
                        if let Some(upstream_outcome) = outcome {
                            self.counters.record_upstream_error(upstream_outcome.kind_label());
                        }
                        if decision == FreshnessDecision::ForceRefresh
                            || metadata.last_update_utc == chrono::DateTime::<chrono::Utc>::UNIX_EPOCH
                        {
                            // Cold mirror (never successfully populated) or
                            // a hard requirement for data we don't have:
                            // there is nothing to fall back to.
                            self.counters.record_request(command, "unavailable");
                            self.publish(
                                &repo_id,
                                Some(fingerprint),
                                EventKind::UpstreamUnavailable,
                                CacheOutcome::Unavailable,
                                outcome,
                            );
                            Err(err)
                        } else {
                            // Warm mirror, upstream failed: serve what we
                            // have and say so.
                            self.counters.record_request(command, "stale_fallback");
                            self.counters.record_fallback_stale();
                            self.publish(
                                &repo_id,
                                Some(fingerprint),
                                EventKind::FallbackStale,
                                CacheOutcome::StaleFallback,
                                outcome,
                            );
                            Ok(handle)
                        }
                    }
                }
            }
        }
    }

    async fn refresh(
        &self,
        repo_id: &RepositoryId,
        origin_url: &str,
        handle: &Arc<MirrorHandle>,
        credentials: &HashMap<String, String>,
    ) -> Result<(), GobletError> {
        let _guard = self.repo_locks.acquire(repo_id).await;
        let repo_id = repo_id.clone();
        let origin_url = origin_url.to_string();
        let upstream = self.upstream.clone();
        let git_dir = handle.git_dir.clone();
        let current_refs = self.mirrors.refs(handle).await.unwrap_or_default();
        let credentials = credentials.clone();

        self.publish_refresh_started(&repo_id);

        let result = self
            .refresh_flight
            .dedup(&repo_id, Fingerprint([0u8; 32]), async move {
                // Per the freshness policy, a refresh is "upstream ls-refs +
                // fetch of new tips": probe first, and skip the (comparatively
                // expensive) fetch entirely when nothing upstream moved.
                let upstream_refs =
                    retry_transient(|| upstream.ls_refs(&origin_url, &credentials)).await?;
                if !upstream_refs.is_empty() && refs_unchanged(&upstream_refs, &current_refs) {
                    return Ok(());
                }
                retry_transient(|| upstream.fetch_into_mirror(&origin_url, &git_dir, &credentials))
                    .await?;
                swap_refs(&git_dir).await
            })
            .await;

        match result {
            Ok(_) => {
                let mut meta = handle.metadata.write().await;
                meta.last_update_utc = chrono::Utc::now();
                meta.last_upstream_status = crate::error::UpstreamOutcome::Ok;
                drop(meta);
                handle.persist_metadata().await?;
                Ok(())
            }
            Err(err) => {
                let mut meta = handle.metadata.write().await;
                if let Some(outcome) = err.upstream_outcome() {
                    meta.last_upstream_status = outcome;
                }
                drop(meta);
                let _ = handle.persist_metadata().await;
                Err(err)
            }
        }
    }

    fn publish_refresh_started(&self, repo_id: &RepositoryId) {
        self.events.publish(Event {
            kind: EventKind::RefreshStarted,
            repository: repo_id.clone(),
            fingerprint: None,
            bytes: 0,
            duration: Duration::ZERO,
            upstream_status: None,
            cache_outcome: CacheOutcome::MissRefreshed,
        });
    }

    fn publish(
        &self,
        repo_id: &RepositoryId,
        fingerprint: Option<Fingerprint>,
        kind: EventKind,
        outcome: CacheOutcome,
        upstream_status: Option<crate::error::UpstreamOutcome>,
    ) {
        self.events.publish(Event {
            kind,
            repository: repo_id.clone(),
            fingerprint,
            bytes: 0,
            duration: Duration::ZERO,
            upstream_status,
            cache_outcome: outcome,
        });
    }
}

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Transient upstream errors (network, timeout, 5xx) get one retry with
/// exponential backoff, up to `MAX_RETRY_ATTEMPTS` total attempts, capped at
/// `RETRY_MAX_DELAY` between attempts, per spec §4.H/§7; everything else
/// (auth, malformed protocol, 4xx) fails immediately since retrying wouldn't
/// change the outcome.
async fn retry_transient<F, Fut, T>(mut op: F) -> Result<T, GobletError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GobletError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_RETRY_ATTEMPTS && is_transient(&err) => {
                let delay = RETRY_BASE_DELAY
                    .saturating_mul(1 << (attempt - 1))
                    .min(RETRY_MAX_DELAY);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &GobletError) -> bool {
    match err {
        GobletError::UpstreamNetwork(_) | GobletError::Timeout(_) => true,
        GobletError::UpstreamStatus(code) => *code >= 500,
        _ => false,
    }
}

/// True when the upstream's advertised refs exactly match the mirror's
/// current refs (by name and oid), meaning a fetch would install nothing new.
fn refs_unchanged(upstream: &[UpstreamRef], mirror: &[MirrorRef]) -> bool {
    let mut a: Vec<(&str, &str)> = upstream.iter().map(|r| (r.name.as_str(), r.oid.as_str())).collect();
    let mut b: Vec<(&str, &str)> = mirror.iter().map(|r| (r.name.as_str(), r.oid.as_str())).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// Fast-forwards `refs/*` to match the just-fetched `refs/mirror/*`,
/// guaranteeing a failed fetch never leaves visible refs partially updated
/// (spec §8: atomic pack install / connectivity invariant).
async fn swap_refs(git_dir: &std::path::Path) -> Result<(), GobletError> {
    let output = tokio::process::Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .arg("for-each-ref")
        .arg("--format=%(refname)")
        .arg("refs/mirror")
        .output()
        .await?;
    if !output.status.success() {
        return Err(GobletError::Internal(
            "listing refs/mirror after fetch".into(),
        ));
    }
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Some(suffix) = line.strip_prefix("refs/mirror/") else {
            continue;
        };
        let target = format!("refs/{suffix}");
        let status = tokio::process::Command::new("git")
            .arg("--git-dir")
            .arg(git_dir)
            .arg("update-ref")
            .arg(&target)
            .arg(line)
            .status()
            .await?;
        if !status.success() {
            return Err(GobletError::Internal(format!(
                "updating {target} from {line}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn refs_unchanged_ignores_order() {
        let upstream = vec![
            UpstreamRef { name: "refs/heads/main".into(), oid: "a".repeat(40), symref_target: None },
            UpstreamRef { name: "refs/tags/v1".into(), oid: "b".repeat(40), symref_target: None },
        ];
        let mirror = vec![
            MirrorRef { name: "refs/tags/v1".into(), oid: "b".repeat(40), symref_target: None, peeled: None },
            MirrorRef { name: "refs/heads/main".into(), oid: "a".repeat(40), symref_target: None, peeled: None },
        ];
        assert!(refs_unchanged(&upstream, &mirror));
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();
        let result: Result<(), GobletError> = retry_transient(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GobletError::UpstreamNetwork("simulated".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), u64::from(MAX_RETRY_ATTEMPTS));
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_non_transient_errors() {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();
        let result: Result<(), GobletError> = retry_transient(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GobletError::Unauthorized)
            }
        })
        .await;
        assert!(matches!(result, Err(GobletError::Unauthorized)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refs_unchanged_detects_moved_tip() {
        let upstream = vec![UpstreamRef { name: "refs/heads/main".into(), oid: "a".repeat(40), symref_target: None }];
        let mirror = vec![MirrorRef { name: "refs/heads/main".into(), oid: "c".repeat(40), symref_target: None, peeled: None }];
        assert!(!refs_unchanged(&upstream, &mirror));
    }

    /// Upstream stub that always fails `fetch_into_mirror`, used to exercise
    /// the stale-fallback/unavailable branches of `resolve_fresh_mirror`
    /// without a live git origin.
    struct AlwaysFailsFetch {
        cold: AtomicBool,
    }

    #[async_trait::async_trait]
    impl UpstreamClient for AlwaysFailsFetch {
        async fn ls_refs(
            &self,
            _origin_url: &str,
            _credentials: &HashMap<String, String>,
        ) -> Result<Vec<UpstreamRef>, GobletError> {
            Ok(Vec::new())
        }

        async fn fetch_into_mirror(
            &self,
            _origin_url: &str,
            _git_dir: &std::path::Path,
            _credentials: &HashMap<String, String>,
        ) -> Result<(), GobletError> {
            self.cold.store(false, Ordering::SeqCst);
            Err(GobletError::UpstreamNetwork("simulated outage".into()))
        }
    }

    fn test_state(cache_root: std::path::PathBuf) -> Arc<AppState> {
        let (state, _rx) = AppState::new(
            cache_root,
            Duration::from_secs(5),
            Duration::from_millis(1),
            16,
            Duration::from_secs(5),
        );
        let mut state = Arc::try_unwrap(state).unwrap_or_else(|_| unreachable!());
        state.upstream = Arc::new(AlwaysFailsFetch { cold: AtomicBool::new(true) });
        Arc::new(state)
    }

    #[tokio::test]
    async fn cold_mirror_with_failing_upstream_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let fp = Fingerprint([0u8; 32]);
        let err = state
            .resolve_fresh_mirror("https://example.com/foo.git", false, fp, &HashMap::new(), "fetch")
            .await
            .unwrap_err();
        assert!(matches!(err, GobletError::UpstreamNetwork(_)));
    }

    #[tokio::test]
    async fn warm_mirror_falls_back_to_stale_on_refresh_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path().to_path_buf());
        let fp = Fingerprint([0u8; 32]);

        let repo_id = state
            .canonicalizer
            .canonicalize("https://example.com/foo.git")
            .await
            .unwrap();
        let handle = state.mirrors.open_or_create(&repo_id).await.unwrap();
        {
            let mut meta = handle.metadata.write().await;
            meta.last_update_utc = chrono::Utc::now() - chrono::Duration::seconds(10);
        }
        handle.persist_metadata().await.unwrap();

        let result = state
            .resolve_fresh_mirror("https://example.com/foo.git", false, fp, &HashMap::new(), "fetch")
            .await;
        assert!(result.is_ok(), "warm mirror should fall back to stale data");
    }
}
