//! Fan-out fetcher.
//!
//! Issues one adapter call per source as an independent tokio task and
//! collects results over a channel until every task has reported or the
//! overall deadline passes, whichever comes first. Sources that miss the
//! deadline are recorded as `DeadlineExceeded`; their tasks are left to finish
//! on their own and whatever they send afterwards is dropped with the
//! receiver, so a late result can never reach a published snapshot.
//!
//! Merge rules:
//! - Trajectories: same-id records within one feed are stitched into one
//!   path; across feeds the record with the latest `observed_at` wins, ties
//!   going to the later-configured feed.
//! - Hazards: de-duplicated by id, first configured source wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::models::{DatasetKind, DatasetSnapshot, HazardArea, Trajectory, TrajectoryPoint};
use crate::services::clock::SharedClock;
use crate::services::sources::{
    FetchError, FetchFailure, RawRecords, SourceAdapter, SourceConfig,
};

/// A fan-out round that produced nothing worth publishing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchAggregateError {
    /// Every source failed.
    #[error("all {count} {dataset} sources failed", count = .failures.len())]
    AllFailed {
        dataset: DatasetKind,
        failures: BTreeMap<String, FetchFailure>,
    },
    /// Sources answered, but the merged trajectory set is empty.
    #[error("no {dataset} records returned ({count} sources failed)", count = .failures.len())]
    NoRecords {
        dataset: DatasetKind,
        failures: BTreeMap<String, FetchFailure>,
    },
}

/// Records from one successful source, tagged with its position in the
/// configured source list.
struct SourceRecords<T> {
    order: usize,
    feed: String,
    records: Vec<T>,
}

#[derive(Clone)]
pub struct FanOutFetcher {
    adapter: Arc<dyn SourceAdapter>,
    clock: SharedClock,
    deadline: Duration,
}

impl FanOutFetcher {
    pub fn new(adapter: Arc<dyn SourceAdapter>, clock: SharedClock, deadline: Duration) -> Self {
        Self {
            adapter,
            clock,
            deadline,
        }
    }

    /// Fetch and merge all trajectory sources. A round whose merged set is
    /// empty is a failure, so the cache keeps serving its previous entry.
    pub async fn fetch_trajectories(
        &self,
        sources: &[SourceConfig],
    ) -> Result<DatasetSnapshot<Trajectory>, FetchAggregateError> {
        let (successes, failures) = self
            .fan_out(DatasetKind::Trajectories, sources, |raw| match raw {
                RawRecords::Trajectories(t) => Some(t),
                RawRecords::Hazards(_) => None,
            })
            .await?;
        let data = merge_trajectories(successes);
        if data.is_empty() {
            tracing::warn!("Fetcher: trajectories round returned no records");
            return Err(FetchAggregateError::NoRecords {
                dataset: DatasetKind::Trajectories,
                failures,
            });
        }
        Ok(DatasetSnapshot {
            data,
            fetched_at: self.clock.now(),
            source_errors: failures,
        })
    }

    /// Fetch and merge all hazard sources. No active alerts is a valid
    /// snapshot.
    pub async fn fetch_hazards(
        &self,
        sources: &[SourceConfig],
    ) -> Result<DatasetSnapshot<HazardArea>, FetchAggregateError> {
        let (successes, failures) = self
            .fan_out(DatasetKind::Hazards, sources, |raw| match raw {
                RawRecords::Hazards(h) => Some(h),
                RawRecords::Trajectories(_) => None,
            })
            .await?;
        Ok(DatasetSnapshot {
            data: merge_hazards(successes),
            fetched_at: self.clock.now(),
            source_errors: failures,
        })
    }

    /// Run one round: spawn a task per source, gather until done or deadline.
    /// Fails only when no source succeeded.
    async fn fan_out<T>(
        &self,
        dataset: DatasetKind,
        sources: &[SourceConfig],
        extract: impl Fn(RawRecords) -> Option<Vec<T>>,
    ) -> Result<(Vec<SourceRecords<T>>, BTreeMap<String, FetchFailure>), FetchAggregateError> {
        let started = tokio::time::Instant::now();
        let deadline = started + self.deadline;
        let (tx, mut rx) = mpsc::channel::<(usize, Result<RawRecords, FetchError>)>(
            sources.len().max(1),
        );

        for (order, source) in sources.iter().cloned().enumerate() {
            let tx = tx.clone();
            let adapter = self.adapter.clone();
            tokio::spawn(async move {
                let result = adapter.fetch(&source).await;
                // Fails once the collector has given up; the result is discarded.
                let _ = tx.send((order, result)).await;
            });
        }
        drop(tx);

        let mut results: Vec<Option<Result<RawRecords, FetchError>>> =
            (0..sources.len()).map(|_| None).collect();
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((order, result))) => results[order] = Some(result),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Fetcher: {} deadline of {:?} reached with {} of {} sources outstanding",
                        dataset,
                        self.deadline,
                        results.iter().filter(|r| r.is_none()).count(),
                        sources.len()
                    );
                    break;
                }
            }
        }
        drop(rx);

        let mut successes = Vec::new();
        let mut failures = BTreeMap::new();
        for (order, (source, result)) in sources.iter().zip(results).enumerate() {
            match result {
                Some(Ok(raw)) => match extract(raw) {
                    Some(records) => successes.push(SourceRecords {
                        order,
                        feed: source.feed.clone(),
                        records,
                    }),
                    None => {
                        tracing::warn!(
                            "Fetcher: source {} returned the wrong dataset",
                            source.id
                        );
                        failures.insert(source.id.clone(), FetchFailure::WrongDataset);
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!("Fetcher: {}", e);
                    failures.insert(source.id.clone(), e.reason);
                }
                None => {
                    failures.insert(source.id.clone(), FetchFailure::DeadlineExceeded);
                }
            }
        }

        tracing::info!(
            "Fetcher: {} round complete in {}ms, {} ok, {} failed",
            dataset,
            started.elapsed().as_millis(),
            successes.len(),
            failures.len()
        );

        if successes.is_empty() {
            return Err(FetchAggregateError::AllFailed { dataset, failures });
        }
        Ok((successes, failures))
    }
}

/// Merge trajectory records from all successful sources.
fn merge_trajectories(mut successes: Vec<SourceRecords<Trajectory>>) -> Vec<Trajectory> {
    successes.sort_by_key(|s| s.order);

    // Stage 1: stitch within each feed. Feeds are ordered by their first
    // configured source so stage 2 has a deterministic tie-break.
    let mut feed_order: Vec<String> = Vec::new();
    let mut per_feed: HashMap<String, BTreeMap<String, Vec<TrajectoryPoint>>> =
        HashMap::new();
    for source in successes {
        if !per_feed.contains_key(&source.feed) {
            feed_order.push(source.feed.clone());
        }
        let feed = per_feed.entry(source.feed).or_default();
        for trajectory in source.records {
            feed.entry(trajectory.id.clone())
                .or_default()
                .extend(trajectory.points().iter().cloned());
        }
    }

    // Stage 2: latest observation wins across feeds.
    let mut merged: BTreeMap<String, Trajectory> = BTreeMap::new();
    for feed in feed_order {
        let Some(by_id) = per_feed.remove(&feed) else {
            continue;
        };
        for (id, points) in by_id {
            let Some(candidate) = Trajectory::new(id.clone(), dedup_points(points)) else {
                continue;
            };
            match merged.get(&id) {
                Some(existing)
                    if existing.latest_observed_at() > candidate.latest_observed_at() => {}
                _ => {
                    merged.insert(id, candidate);
                }
            }
        }
    }

    merged.into_values().collect()
}

/// Sort points by time and keep one point per timestamp. Points arrive in
/// source order, so the later-configured source wins a timestamp collision.
fn dedup_points(mut points: Vec<TrajectoryPoint>) -> Vec<TrajectoryPoint> {
    points.sort_by_key(|p| p.observed_at);
    let mut out: Vec<TrajectoryPoint> = Vec::with_capacity(points.len());
    for point in points {
        match out.last_mut() {
            Some(last) if last.observed_at == point.observed_at => *last = point,
            _ => out.push(point),
        }
    }
    out
}

/// Concatenate hazards, keeping the first occurrence of each id.
fn merge_hazards(mut successes: Vec<SourceRecords<HazardArea>>) -> Vec<HazardArea> {
    successes.sort_by_key(|s| s.order);
    let mut merged: BTreeMap<String, HazardArea> = BTreeMap::new();
    for source in successes {
        for hazard in source.records {
            merged.entry(hazard.id.clone()).or_insert(hazard);
        }
    }
    merged.into_values().collect()
}
