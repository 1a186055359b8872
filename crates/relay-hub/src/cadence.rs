//! Periodic fetch-and-broadcast loop.

use std::sync::Arc;
use std::time::Duration;

use relay_core::DataSource;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEngine;

/// Every `interval`, fetch a payload from `source` and broadcast it.
///
/// The first round goes out immediately. A failed fetch skips that round.
/// Returns when `cancel` fires.
pub async fn run_cadence(
    engine: Arc<BroadcastEngine>,
    source: Arc<dyn DataSource>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(source = source.name(), interval_secs = interval.as_secs(), "broadcast cadence started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match source.fetch().await {
                    Ok(payload) => {
                        let report = engine.broadcast(&payload);
                        debug!(round_id = ?report.round, delivered = report.delivered.len(), "round complete");
                    }
                    Err(e) => {
                        warn!(source = source.name(), error = %e, kind = e.error_kind(), "fetch failed, skipping round");
                    }
                }
            }
        }
    }
    info!("broadcast cadence stopped");
}
