//! Transport-agnostic liveness monitoring.
//!
//! Any inbound frame counts as a heartbeat; the receive loop calls
//! [`Connection::touch`] for every frame it reads. The monitor only compares
//! idle time against the configured threshold.

use std::sync::Arc;

use socketry_settings::HeartbeatSettings;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No frame arrived within `interval × try_times`.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Watch a connection until it goes quiet or `cancel` fires.
///
/// Ticks every `settings.interval()`, starting one interval after the call.
/// A connection whose idle time exceeds `settings.threshold()` is reported on
/// the first tick after that, so teardown happens within one interval of the
/// threshold passing.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = settings.interval();
    let threshold = settings.threshold();
    let mut ticks = time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
            _ = ticks.tick() => {
                if connection.idle_for() > threshold {
                    return HeartbeatResult::TimedOut;
                }
            }
        }
    }
}
