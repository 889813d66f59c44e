use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{PollTier, TrackingSource};
use crate::error::FetchError;
use crate::models::{NotificationRequest, RideId, TrackingSnapshot};
use crate::notifications::NotificationQueue;
use crate::session::SessionContext;
use crate::store::{SnapshotMerge, TrackingStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Full snapshot poll while tracking is on screen. `None` disables it.
    pub live_interval: Option<Duration>,
    /// Status-only staleness check. `None` disables it.
    pub status_interval: Option<Duration>,
    /// Consecutive failures before the user is told updates are delayed.
    pub failure_threshold: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            live_interval: Some(Duration::from_secs(15)),
            status_interval: Some(Duration::from_secs(30)),
            failure_threshold: 3,
        }
    }
}

impl PollSettings {
    pub fn is_enabled(&self) -> bool {
        self.live_interval.is_some() || self.status_interval.is_some()
    }

    pub fn tiers(&self) -> Vec<(PollTier, Duration)> {
        let mut tiers = Vec::new();
        if let Some(period) = self.live_interval {
            tiers.push((PollTier::Live, period));
        }
        if let Some(period) = self.status_interval {
            tiers.push((PollTier::StatusOnly, period));
        }
        tiers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollHealth {
    pub ticks: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<FetchError>,
    pub last_success_at: Option<DateTime<Utc>>,
}

pub type MergeCallback = Arc<dyn Fn(&RideId, &TrackingSnapshot, SnapshotMerge) + Send + Sync>;

/// Everything a poll loop needs besides its tier and period.
#[derive(Clone)]
pub struct PollContext {
    pub source: Arc<dyn TrackingSource>,
    pub session: SessionContext,
    pub store: TrackingStore,
    pub notifications: NotificationQueue,
    pub failure_threshold: u32,
    pub on_merge: Option<MergeCallback>,
}

/// Handle to one running poll loop.
pub struct Poller {
    tier: PollTier,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    health: watch::Receiver<PollHealth>,
}

impl Poller {
    pub fn spawn(ride_id: RideId, tier: PollTier, period: Duration, ctx: PollContext) -> Self {
        let cancel = CancellationToken::new();
        let (health_tx, health) = watch::channel(PollHealth::default());
        let handle = tokio::spawn(poll_loop(ride_id, tier, period, ctx, cancel.clone(), health_tx));
        Self {
            tier,
            cancel,
            handle,
            health,
        }
    }

    pub fn tier(&self) -> PollTier {
        self.tier
    }

    pub fn health(&self) -> PollHealth {
        self.health.borrow().clone()
    }

    /// `true` once the loop has exited (stopped, or the ride went terminal).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    ride_id: RideId,
    tier: PollTier,
    period: Duration,
    ctx: PollContext,
    cancel: CancellationToken,
    health_tx: watch::Sender<PollHealth>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut delayed_notice_shown = false;

    info!("Polling ride {} ({:?}) every {:?}", ride_id, tier, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match ctx.store.snapshot(&ride_id) {
            None => {
                debug!("Ride {} no longer tracked, stopping {:?} poll", ride_id, tier);
                break;
            }
            Some(ride) if ride.ride_status.is_terminal() => {
                info!("Ride {} is {}, suspending {:?} poll", ride_id, ride.ride_status, tier);
                break;
            }
            Some(_) => {}
        }

        let result = match ctx.session.credentials() {
            Some(credentials) => {
                let fetch = tokio::time::timeout(period, ctx.source.fetch(&ride_id, tier, &credentials));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = fetch => r.unwrap_or(Err(FetchError::Timeout)),
                }
            }
            None => Err(FetchError::Http("not authenticated".to_string())),
        };

        match result {
            Ok(snapshot) => {
                let merge = ctx.store.apply_snapshot(&ride_id, &snapshot);
                debug!("Ride {} {:?} poll merged: {:?}", ride_id, tier, merge);
                if let Some(on_merge) = &ctx.on_merge {
                    on_merge(&ride_id, &snapshot, merge);
                }
                delayed_notice_shown = false;
                health_tx.send_modify(|h| {
                    h.ticks += 1;
                    h.consecutive_failures = 0;
                    h.last_error = None;
                    h.last_success_at = Some(snapshot.received_at);
                });
            }
            Err(e) => {
                let mut failures = 0;
                health_tx.send_modify(|h| {
                    h.ticks += 1;
                    h.consecutive_failures += 1;
                    h.last_error = Some(e.clone());
                    failures = h.consecutive_failures;
                });
                warn!(
                    "Tracking poll for ride {} failed ({} in a row): {}",
                    ride_id, failures, e
                );
                if failures >= ctx.failure_threshold && !delayed_notice_shown {
                    ctx.notifications
                        .push(NotificationRequest::updates_delayed(failures));
                    delayed_notice_shown = true;
                }
            }
        }
    }

    debug!("Poll loop for ride {} ({:?}) exited", ride_id, tier);
}
