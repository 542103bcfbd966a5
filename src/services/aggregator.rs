//! Aggregation facade.
//!
//! The only entry point the HTTP layer talks to. Holds one `TtlCache` per
//! dataset and the configured classifier; owns no other state. Monitoring
//! flags are recomputed on every call from whatever the two caches currently
//! hold, since the datasets refresh on independent schedules.

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::models::{DatasetKind, HazardArea, Trajectory};
use crate::services::cache::{CacheMissError, CachedSnapshot, DatasetHealth, RefreshFn, TtlCache};
use crate::services::clock::SharedClock;
use crate::services::fetcher::FanOutFetcher;
use crate::services::proximity::{classify, ProximityClassifier};
use crate::services::sources::SourceConfig;

/// Cache whose refresh is one fan-out round over the trajectory sources.
pub fn trajectory_cache(
    fetcher: FanOutFetcher,
    sources: Vec<SourceConfig>,
    ttl: Duration,
    clock: SharedClock,
) -> TtlCache<Trajectory> {
    let sources = Arc::new(sources);
    let refresh: RefreshFn<Trajectory> = Arc::new(move || {
        let fetcher = fetcher.clone();
        let sources = sources.clone();
        async move { fetcher.fetch_trajectories(&sources).await }.boxed()
    });
    TtlCache::new(DatasetKind::Trajectories, ttl, clock, refresh)
}

/// Cache whose refresh is one fan-out round over the hazard sources.
pub fn hazard_cache(
    fetcher: FanOutFetcher,
    sources: Vec<SourceConfig>,
    ttl: Duration,
    clock: SharedClock,
) -> TtlCache<HazardArea> {
    let sources = Arc::new(sources);
    let refresh: RefreshFn<HazardArea> = Arc::new(move || {
        let fetcher = fetcher.clone();
        let sources = sources.clone();
        async move { fetcher.fetch_hazards(&sources).await }.boxed()
    });
    TtlCache::new(DatasetKind::Hazards, ttl, clock, refresh)
}

/// Trajectories with their monitoring flags, as served to API consumers.
#[derive(Debug, Clone)]
pub struct TrajectoryView {
    pub trajectories: CachedSnapshot<Trajectory>,
    pub monitoring: BTreeSet<String>,
    /// False when hazards could not be loaded; every flag is then false.
    pub hazards_available: bool,
    /// Either dataset was served from an expired entry.
    pub is_stale: bool,
}

impl TrajectoryView {
    pub fn is_monitoring(&self, id: &str) -> bool {
        self.monitoring.contains(id)
    }
}

#[derive(Clone)]
pub struct Aggregator {
    trajectories: TtlCache<Trajectory>,
    hazards: TtlCache<HazardArea>,
    classifier: ProximityClassifier,
}

impl Aggregator {
    pub fn new(
        trajectories: TtlCache<Trajectory>,
        hazards: TtlCache<HazardArea>,
        classifier: ProximityClassifier,
    ) -> Self {
        Self {
            trajectories,
            hazards,
            classifier,
        }
    }

    pub async fn get_trajectories(&self) -> Result<CachedSnapshot<Trajectory>, CacheMissError> {
        self.trajectories.get().await
    }

    pub async fn get_hazards(&self) -> Result<CachedSnapshot<HazardArea>, CacheMissError> {
        self.hazards.get().await
    }

    /// Ids of trajectories inside the buffer of any current hazard. Both
    /// datasets are required.
    pub async fn get_monitoring_set(&self) -> Result<BTreeSet<String>, CacheMissError> {
        let (trajectories, hazards) = tokio::join!(self.trajectories.get(), self.hazards.get());
        let (trajectories, hazards) = (trajectories?, hazards?);
        Ok(self
            .classifier
            .classify(&trajectories.snapshot.data, &hazards.snapshot.data))
    }

    /// Trajectories plus monitoring flags at the configured threshold, or at
    /// `threshold_km` when given (callers validate it). Trajectories are
    /// required; missing hazards degrade to "nothing is monitoring".
    pub async fn trajectory_view(
        &self,
        threshold_km: Option<f64>,
    ) -> Result<TrajectoryView, CacheMissError> {
        let (trajectories, hazards) = tokio::join!(self.trajectories.get(), self.hazards.get());
        let trajectories = trajectories?;
        let threshold_km = threshold_km.unwrap_or_else(|| self.classifier.threshold_km());

        match hazards {
            Ok(hazards) => {
                let monitoring = classify(
                    &trajectories.snapshot.data,
                    &hazards.snapshot.data,
                    threshold_km,
                );
                Ok(TrajectoryView {
                    is_stale: trajectories.is_stale || hazards.is_stale,
                    trajectories,
                    monitoring,
                    hazards_available: true,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Aggregator: {}; serving {} trajectories without monitoring flags",
                    e,
                    trajectories.snapshot.data.len()
                );
                Ok(TrajectoryView {
                    is_stale: trajectories.is_stale,
                    trajectories,
                    monitoring: BTreeSet::new(),
                    hazards_available: false,
                })
            }
        }
    }

    pub async fn health(&self) -> Vec<DatasetHealth> {
        vec![self.trajectories.health().await, self.hazards.health().await]
    }

    /// Earliest moment either dataset stops being fresh. `None` until both
    /// have an entry.
    pub async fn next_expiry(&self) -> Option<DateTime<Utc>> {
        let trajectories = self.trajectories.expires_at().await;
        let hazards = self.hazards.expires_at().await;
        match (trajectories, hazards) {
            (Some(t), Some(h)) => Some(t.min(h)),
            _ => None,
        }
    }
}
