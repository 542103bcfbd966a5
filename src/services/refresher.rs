//! Background refresh-ahead loop.
//!
//! Keeps both dataset caches warm so request handlers rarely wait on
//! upstream. Each cycle reads both datasets through the facade (a read of an
//! expired entry triggers the usual coalesced refresh), then sleeps until
//! the earliest cache expiry plus a small buffer. Because it goes through the
//! same caches as the handlers, it can never add a second upstream fetch to
//! a refresh cycle.

use chrono::{DateTime, Duration, Utc};

use crate::services::aggregator::Aggregator;
use crate::services::clock::SharedClock;

/// Buffer added after the earliest expiry before waking (seconds).
const REFRESH_WAKEUP_BUFFER_SECS: i64 = 5;

/// Minimum sleep duration between refresh cycles (seconds).
const REFRESH_MIN_SLEEP_SECS: u64 = 30;

/// Maximum sleep duration between refresh cycles (seconds).
const REFRESH_MAX_SLEEP_SECS: u64 = 900;

/// Seconds to sleep before the next cycle. With nothing cached yet, retry
/// after the minimum sleep.
pub fn compute_sleep_secs(earliest_expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    let Some(expiry) = earliest_expiry else {
        return REFRESH_MIN_SLEEP_SECS;
    };
    let next_wakeup = expiry + Duration::seconds(REFRESH_WAKEUP_BUFFER_SECS);
    let until_wakeup = (next_wakeup - now).num_seconds().max(0) as u64;
    until_wakeup.clamp(REFRESH_MIN_SLEEP_SECS, REFRESH_MAX_SLEEP_SECS)
}

/// Run the refresher. Never returns; spawn it with `tokio::spawn`.
pub async fn run_refresher(aggregator: Aggregator, clock: SharedClock) {
    tracing::info!("Background refresher started");

    loop {
        let cycle_start = clock.now();

        let (trajectories, hazards) =
            tokio::join!(aggregator.get_trajectories(), aggregator.get_hazards());

        match &trajectories {
            Ok(t) => tracing::debug!(
                "Refresher: {} trajectories (stale: {})",
                t.snapshot.data.len(),
                t.is_stale
            ),
            Err(e) => tracing::warn!("Refresher: {}", e),
        }
        match &hazards {
            Ok(h) => tracing::debug!(
                "Refresher: {} hazards (stale: {})",
                h.snapshot.data.len(),
                h.is_stale
            ),
            Err(e) => tracing::warn!("Refresher: {}", e),
        }

        let earliest_expiry = aggregator.next_expiry().await;
        let now = clock.now();
        let sleep_secs = compute_sleep_secs(earliest_expiry, now);

        tracing::info!(
            "Refresher: cycle complete in {}ms, sleeping {}s (earliest expiry: {:?})",
            (now - cycle_start).num_milliseconds().max(0),
            sleep_secs,
            earliest_expiry,
        );

        tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;
    }
}
