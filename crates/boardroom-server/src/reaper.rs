//! Ticker-driven background sweeps: client liveness, stale-game cleanup,
//! and the periodic view refresh / roster rebroadcast.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use boardroom_core::time::now_millis;

use crate::config::ServerConfig;
use crate::hub::Hub;

#[derive(Debug, Clone, Copy)]
pub struct ReaperIntervals {
    pub liveness: Duration,
    pub cleanup: Duration,
    pub refresh: Duration,
}

impl From<&ServerConfig> for ReaperIntervals {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            liveness: Duration::from_secs(cfg.hub.liveness_check_interval_secs),
            cleanup: Duration::from_secs(cfg.sessions.cleanup_interval_secs),
            refresh: Duration::from_secs(cfg.hub.refresh_interval_secs),
        }
    }
}

async fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;
    interval
}

pub fn spawn_reaper(
    hub: Hub,
    intervals: ReaperIntervals,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_reaper(hub, intervals, shutdown))
}

async fn run_reaper(hub: Hub, intervals: ReaperIntervals, shutdown: CancellationToken) {
    let mut liveness = ticker(intervals.liveness).await;
    let mut cleanup = ticker(intervals.cleanup).await;
    let mut refresh = ticker(intervals.refresh).await;
    tracing::info!(?intervals, "Reaper started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = liveness.tick() => {
                let removed = hub.sweep_inactive(now_millis()).await;
                if removed > 0 {
                    tracing::info!(removed, "Inactive clients unregistered");
                }
            },
            _ = cleanup.tick() => {
                let removed = hub.registry().cleanup_stale_games().await;
                tracing::debug!(removed = removed.len(), "Stale game sweep ran");
            },
            _ = refresh.tick() => {
                let games = hub.refresh_all().await;
                tracing::debug!(games, "Refreshed game views");
            },
        }
    }
    tracing::info!("Reaper stopped");
}
