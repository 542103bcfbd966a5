//! TTL cache for one dataset key.
//!
//! Holds the last successfully aggregated snapshot with an expiry derived
//! from `fetched_at + ttl`. Reads of a fresh entry never touch upstream. A
//! missing or expired entry triggers a refresh; concurrent callers join the
//! refresh already in flight instead of starting their own, so there is
//! exactly one refresh call per cycle.
//!
//! Entry, in-flight handle, and refresh bookkeeping live behind one
//! `tokio::sync::Mutex` per cache instance. "Check, then start or join a
//! refresh" happens under that lock and is atomic with respect to other
//! callers. The refresh itself runs as a spawned task, so a caller that gives
//! up does not cancel it for everyone else.
//!
//! On refresh failure the previous entry, even if expired, keeps being
//! served (flagged stale); only a cache that never had an entry surfaces
//! `CacheMissError`. A refresh that panics counts as a failure.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::models::{DatasetKind, DatasetSnapshot};
use crate::services::clock::SharedClock;
use crate::services::fetcher::FetchAggregateError;

/// No snapshot could be produced and none was cached.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{dataset} data temporarily unavailable: {reason}")]
pub struct CacheMissError {
    pub dataset: DatasetKind,
    pub reason: String,
}

/// A snapshot as returned to callers.
#[derive(Debug)]
pub struct CachedSnapshot<T> {
    pub snapshot: Arc<DatasetSnapshot<T>>,
    /// Served from an expired entry because the latest refresh failed.
    pub is_stale: bool,
}

impl<T> Clone for CachedSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
            is_stale: self.is_stale,
        }
    }
}

/// Produces a fresh snapshot for the cache. Called at most once per refresh
/// cycle.
pub type RefreshFn<T> = Arc<
    dyn Fn() -> BoxFuture<'static, Result<DatasetSnapshot<T>, FetchAggregateError>> + Send + Sync,
>;

type RefreshOutcome<T> = Result<CachedSnapshot<T>, CacheMissError>;
type InFlight<T> = Shared<BoxFuture<'static, RefreshOutcome<T>>>;

/// A cached snapshot and the moment it stops being fresh.
struct CacheEntry<T> {
    snapshot: Arc<DatasetSnapshot<T>>,
    expires_at: DateTime<Utc>,
}

/// Outcome of the most recent refresh attempt.
#[derive(Debug, Clone)]
struct LastRefresh {
    at: DateTime<Utc>,
    error: Option<String>,
}

struct CacheState<T> {
    entry: Option<CacheEntry<T>>,
    in_flight: Option<InFlight<T>>,
    last_refresh: Option<LastRefresh>,
    last_success_at: Option<DateTime<Utc>>,
}

struct Inner<T> {
    dataset: DatasetKind,
    ttl: Duration,
    clock: SharedClock,
    refresh: RefreshFn<T>,
    state: Mutex<CacheState<T>>,
}

/// Health of one dataset, exposed via the health endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetHealth {
    pub dataset: String,
    /// Most recent refresh succeeded and its entry is still within the TTL.
    pub healthy: bool,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Per-source failures recorded in the current snapshot.
    pub source_errors: BTreeMap<String, String>,
}

/// Cache handle. Cheap to clone; clones share the same entry.
pub struct TtlCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TtlCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> TtlCache<T> {
    pub fn new(
        dataset: DatasetKind,
        ttl: Duration,
        clock: SharedClock,
        refresh: RefreshFn<T>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dataset,
                ttl,
                clock,
                refresh,
                state: Mutex::new(CacheState {
                    entry: None,
                    in_flight: None,
                    last_refresh: None,
                    last_success_at: None,
                }),
            }),
        }
    }

    /// Return the cached snapshot, refreshing first if it is missing or
    /// expired.
    pub async fn get(&self) -> Result<CachedSnapshot<T>, CacheMissError> {
        let refresh = {
            let mut state = self.inner.state.lock().await;
            if let Some(entry) = &state.entry {
                if self.inner.clock.now() < entry.expires_at {
                    return Ok(CachedSnapshot {
                        snapshot: entry.snapshot.clone(),
                        is_stale: false,
                    });
                }
            }

            match &state.in_flight {
                Some(in_flight) => {
                    tracing::debug!("Cache {}: joining in-flight refresh", self.inner.dataset);
                    in_flight.clone()
                }
                None => {
                    let in_flight = self.spawn_refresh();
                    state.in_flight = Some(in_flight.clone());
                    in_flight
                }
            }
        };

        refresh.await
    }

    /// When the current entry stops being fresh, if there is one.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        let state = self.inner.state.lock().await;
        state.entry.as_ref().map(|e| e.expires_at)
    }

    pub async fn health(&self) -> DatasetHealth {
        let state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let last_ok = state
            .last_refresh
            .as_ref()
            .map(|r| r.error.is_none())
            .unwrap_or(false);
        let fresh = state
            .entry
            .as_ref()
            .map(|e| now < e.expires_at)
            .unwrap_or(false);

        DatasetHealth {
            dataset: self.inner.dataset.to_string(),
            healthy: last_ok && fresh,
            last_refresh_at: state.last_refresh.as_ref().map(|r| r.at),
            last_success_at: state.last_success_at,
            expires_at: state.entry.as_ref().map(|e| e.expires_at),
            last_error: state.last_refresh.as_ref().and_then(|r| r.error.clone()),
            source_errors: state
                .entry
                .as_ref()
                .map(|e| {
                    e.snapshot
                        .source_errors
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Start the refresh task. Must be called with the state lock held so
    /// that the returned handle is recorded before anyone else checks.
    fn spawn_refresh(&self) -> InFlight<T> {
        let inner = self.inner.clone();
        tracing::debug!("Cache {}: starting refresh", inner.dataset);

        let handle = tokio::spawn(async move {
            let result = match AssertUnwindSafe(async { (inner.refresh)().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(panic) => Err(format!("refresh panicked: {}", panic_message(&*panic))),
            };
            // Cleared on every outcome so the next read can start over.
            let mut state = inner.state.lock().await;
            state.in_flight = None;
            inner.complete_refresh(&mut state, result)
        });

        let dataset = self.inner.dataset;
        handle
            .map(move |joined| {
                joined.unwrap_or_else(|e| {
                    Err(CacheMissError {
                        dataset,
                        reason: format!("refresh task failed: {}", e),
                    })
                })
            })
            .boxed()
            .shared()
    }
}

impl<T> Inner<T> {
    /// Apply a refresh result to the state and produce the outcome every
    /// waiting caller receives.
    fn complete_refresh(
        &self,
        state: &mut CacheState<T>,
        result: Result<DatasetSnapshot<T>, String>,
    ) -> RefreshOutcome<T> {
        let now = self.clock.now();
        match result {
            Ok(snapshot) => {
                let expires_at = snapshot.fetched_at + self.ttl;
                let snapshot = Arc::new(snapshot);
                tracing::info!(
                    "Cache {}: refreshed with {} records ({} source errors), fresh until {}",
                    self.dataset,
                    snapshot.data.len(),
                    snapshot.source_errors.len(),
                    expires_at
                );
                state.entry = Some(CacheEntry {
                    snapshot: snapshot.clone(),
                    expires_at,
                });
                state.last_refresh = Some(LastRefresh { at: now, error: None });
                state.last_success_at = Some(now);
                Ok(CachedSnapshot {
                    snapshot,
                    is_stale: false,
                })
            }
            Err(e) => {
                state.last_refresh = Some(LastRefresh {
                    at: now,
                    error: Some(e.clone()),
                });
                match &state.entry {
                    Some(entry) => {
                        tracing::warn!(
                            "Cache {}: refresh failed, serving stale snapshot from {}: {}",
                            self.dataset,
                            entry.snapshot.fetched_at,
                            e
                        );
                        Ok(CachedSnapshot {
                            snapshot: entry.snapshot.clone(),
                            is_stale: true,
                        })
                    }
                    None => {
                        tracing::warn!(
                            "Cache {}: refresh failed and nothing cached: {}",
                            self.dataset,
                            e
                        );
                        Err(CacheMissError {
                            dataset: self.dataset,
                            reason: e,
                        })
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::{Clock, ManualClock};
    use crate::services::sources::FetchFailure;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn start() -> DateTime<Utc> {
        "2026-09-01T12:00:00Z".parse().unwrap()
    }

    /// Refresh function that counts calls and fails while `fail` is set.
    /// `panic_next` makes the next call panic once.
    struct Upstream {
        calls: AtomicUsize,
        fail: AtomicBool,
        panic_next: AtomicBool,
        clock: Arc<ManualClock>,
    }

    impl Upstream {
        fn new(clock: Arc<ManualClock>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                panic_next: AtomicBool::new(false),
                clock,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn refresh_fn(self: &Arc<Self>) -> RefreshFn<String> {
            let upstream = self.clone();
            Arc::new(move || {
                let upstream = upstream.clone();
                async move {
                    let n = upstream.calls.fetch_add(1, Ordering::SeqCst) + 1;
                    // Keep the refresh in flight long enough for callers to pile up.
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    if upstream.panic_next.swap(false, Ordering::SeqCst) {
                        panic!("upstream exploded");
                    }
                    if upstream.fail.load(Ordering::SeqCst) {
                        let mut failures = BTreeMap::new();
                        failures.insert("s1".to_string(), FetchFailure::Status(502));
                        return Err(FetchAggregateError::AllFailed {
                            dataset: DatasetKind::Trajectories,
                            failures,
                        });
                    }
                    Ok(DatasetSnapshot {
                        data: vec![format!("round-{}", n)],
                        fetched_at: upstream.clock.now(),
                        source_errors: BTreeMap::new(),
                    })
                }
                .boxed()
            })
        }
    }

    fn cache(clock: &Arc<ManualClock>, upstream: &Arc<Upstream>) -> TtlCache<String> {
        TtlCache::new(
            DatasetKind::Trajectories,
            Duration::minutes(10),
            clock.clone(),
            upstream.refresh_fn(),
        )
    }

    #[tokio::test]
    async fn test_fresh_entry_served_without_refetch() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let first = cache.get().await.unwrap();
        clock.advance(Duration::minutes(9));
        let second = cache.get().await.unwrap();

        assert_eq!(upstream.calls(), 1);
        assert!(Arc::ptr_eq(&first.snapshot, &second.snapshot));
        assert!(!second.is_stale);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        cache.get().await.unwrap();
        clock.advance(Duration::minutes(10));
        let second = cache.get().await.unwrap();

        assert_eq!(upstream.calls(), 2);
        assert_eq!(second.snapshot.data, vec!["round-2".to_string()]);
        assert_eq!(
            cache.expires_at().await,
            Some(start() + Duration::minutes(20))
        );
    }

    #[tokio::test]
    async fn test_concurrent_cold_reads_coalesce() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let results = futures::future::join_all((0..16).map(|_| cache.get())).await;

        assert_eq!(upstream.calls(), 1);
        let first = results[0].as_ref().unwrap().snapshot.clone();
        for r in &results {
            assert!(Arc::ptr_eq(&r.as_ref().unwrap().snapshot, &first));
        }
    }

    #[tokio::test]
    async fn test_concurrent_reads_from_spawned_tasks_coalesce() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await })
            })
            .collect();
        let mut snapshots = Vec::new();
        for h in handles {
            snapshots.push(h.await.unwrap().unwrap().snapshot);
        }

        assert_eq!(upstream.calls(), 1);
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
    }

    #[tokio::test]
    async fn test_refresh_is_pending_until_upstream_answers() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let mut first = tokio_test::task::spawn(cache.get());
        tokio_test::assert_pending!(first.poll());
        let mut second = tokio_test::task::spawn(cache.get());
        tokio_test::assert_pending!(second.poll());

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(upstream.calls(), 1);
        assert!(Arc::ptr_eq(&a.snapshot, &b.snapshot));
    }

    #[tokio::test]
    async fn test_total_failure_without_entry_is_cache_miss() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        upstream.fail.store(true, Ordering::SeqCst);
        let cache = cache(&clock, &upstream);

        let err = cache.get().await.unwrap_err();
        assert_eq!(err.dataset, DatasetKind::Trajectories);
        assert!(cache.expires_at().await.is_none(), "No entry may be created");

        // Not cached as a negative result either: the next read retries.
        let _ = cache.get().await;
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_total_failure_serves_prior_snapshot() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let first = cache.get().await.unwrap();
        clock.advance(Duration::minutes(30));
        upstream.fail.store(true, Ordering::SeqCst);

        let stale = cache.get().await.unwrap();
        assert!(stale.is_stale);
        assert!(Arc::ptr_eq(&first.snapshot, &stale.snapshot));
        assert_eq!(*stale.snapshot, *first.snapshot);
    }

    #[tokio::test]
    async fn test_recovery_after_failure_replaces_entry() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        cache.get().await.unwrap();
        clock.advance(Duration::minutes(11));
        upstream.fail.store(true, Ordering::SeqCst);
        assert!(cache.get().await.unwrap().is_stale);

        upstream.fail.store(false, Ordering::SeqCst);
        let recovered = cache.get().await.unwrap();
        assert!(!recovered.is_stale);
        assert_eq!(recovered.snapshot.data, vec!["round-3".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_refresh_without_entry_is_retried() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        upstream.panic_next.store(true, Ordering::SeqCst);
        let cache = cache(&clock, &upstream);

        let err = cache.get().await.unwrap_err();
        assert!(err.reason.contains("upstream exploded"), "got {}", err.reason);

        let recovered = cache.get().await.unwrap();
        assert_eq!(upstream.calls(), 2, "The panicked refresh must not be rejoined");
        assert!(!recovered.is_stale);
    }

    #[tokio::test]
    async fn test_panicking_refresh_serves_prior_snapshot() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let first = cache.get().await.unwrap();
        clock.advance(Duration::minutes(10));
        upstream.panic_next.store(true, Ordering::SeqCst);

        let stale = cache.get().await.unwrap();
        assert!(stale.is_stale);
        assert!(Arc::ptr_eq(&first.snapshot, &stale.snapshot));
        assert!(cache
            .health()
            .await
            .last_error
            .unwrap()
            .contains("refresh panicked"));

        let fresh = cache.get().await.unwrap();
        assert!(!fresh.is_stale);
        assert_eq!(fresh.snapshot.data, vec!["round-3".to_string()]);
        assert_eq!(upstream.calls(), 3);
    }

    #[tokio::test]
    async fn test_health_reflects_last_refresh() {
        let clock = ManualClock::new(start());
        let upstream = Upstream::new(clock.clone());
        let cache = cache(&clock, &upstream);

        let health = cache.health().await;
        assert!(!health.healthy, "Never refreshed is not healthy");
        assert_eq!(health.dataset, "trajectories");

        cache.get().await.unwrap();
        assert!(cache.health().await.healthy);

        clock.advance(Duration::minutes(10));
        assert!(!cache.health().await.healthy, "Expired entry is not healthy");

        upstream.fail.store(true, Ordering::SeqCst);
        cache.get().await.unwrap();
        let health = cache.health().await;
        assert!(!health.healthy);
        assert!(health.last_error.unwrap().contains("all 1 trajectories sources failed"));
        assert_eq!(health.last_success_at, Some(start()));
    }
}
