//! In-memory view of every observed ride.
//!
//! Push events and poll results both land here through `apply_location`,
//! `apply_status` and `apply_driver`. Freshness alone decides whether an update
//! is kept: a location must be strictly newer than the stored one, a status or
//! driver update must not be older than the last accepted event.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::models::{DriverInfo, Location, RideId, RideStatus, TrackedRide, TrackingSnapshot};

struct Entry {
    ride: TrackedRide,
    tx: watch::Sender<Option<TrackedRide>>,
}

impl Entry {
    fn publish(&self) {
        self.tx.send_replace(Some(self.ride.clone()));
    }
}

/// What a poll result changed, field by field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMerge {
    pub location: bool,
    pub status: bool,
    pub driver: bool,
}

#[derive(Clone, Default)]
pub struct TrackingStore {
    rides: Arc<Mutex<HashMap<RideId, Entry>>>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `ride_id` (no-op if already tracked) and returns a feed of its snapshots.
    pub fn track(&self, ride_id: &RideId) -> watch::Receiver<Option<TrackedRide>> {
        let mut rides = self.rides.lock();
        let entry = rides.entry(ride_id.clone()).or_insert_with(|| {
            let ride = TrackedRide::new(ride_id.clone());
            let (tx, _) = watch::channel(Some(ride.clone()));
            Entry { ride, tx }
        });
        entry.tx.subscribe()
    }

    /// Drops the ride. Subscribers observe `None`.
    pub fn untrack(&self, ride_id: &RideId) -> bool {
        match self.rides.lock().remove(ride_id) {
            Some(entry) => {
                entry.tx.send_replace(None);
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, ride_id: &RideId) -> bool {
        self.rides.lock().contains_key(ride_id)
    }

    pub fn snapshot(&self, ride_id: &RideId) -> Option<TrackedRide> {
        self.rides.lock().get(ride_id).map(|e| e.ride.clone())
    }

    pub fn subscribe(&self, ride_id: &RideId) -> Option<watch::Receiver<Option<TrackedRide>>> {
        self.rides.lock().get(ride_id).map(|e| e.tx.subscribe())
    }

    /// Returns `true` when the location was stored.
    pub fn apply_location(&self, ride_id: &RideId, location: Location) -> bool {
        let mut rides = self.rides.lock();
        let Some(entry) = rides.get_mut(ride_id) else {
            debug!("Location for untracked ride {} ignored", ride_id);
            return false;
        };

        if let Some(current) = &entry.ride.last_known_location {
            if location.observed_at <= current.observed_at {
                debug!(
                    "Stale location for ride {} ignored ({} <= {})",
                    ride_id, location.observed_at, current.observed_at
                );
                return false;
            }
        }

        let observed_at = location.observed_at;
        entry.ride.last_known_location = Some(location);
        advance(&mut entry.ride.last_event_at, observed_at);
        entry.publish();
        true
    }

    /// Returns `true` when the ride's status changed. A repeat of the current
    /// status still advances `last_event_at` if it is newer.
    pub fn apply_status(&self, ride_id: &RideId, status: RideStatus, at: DateTime<Utc>) -> bool {
        let mut rides = self.rides.lock();
        let Some(entry) = rides.get_mut(ride_id) else {
            debug!("Status for untracked ride {} ignored", ride_id);
            return false;
        };

        if is_older(&entry.ride, at) {
            debug!("Stale status {} for ride {} ignored", status, ride_id);
            return false;
        }

        let changed = entry.ride.ride_status != status;
        let moved = advance(&mut entry.ride.last_event_at, at);
        entry.ride.ride_status = status;
        if changed || moved {
            entry.publish();
        }
        changed
    }

    /// Returns `true` when the driver details changed. A repeat of the current
    /// driver is a no-op and leaves `last_event_at` untouched.
    pub fn apply_driver(&self, ride_id: &RideId, driver: DriverInfo, at: DateTime<Utc>) -> bool {
        let mut rides = self.rides.lock();
        let Some(entry) = rides.get_mut(ride_id) else {
            debug!("Driver for untracked ride {} ignored", ride_id);
            return false;
        };

        if entry.ride.driver_info.as_ref() == Some(&driver) {
            return false;
        }
        if is_older(&entry.ride, at) {
            debug!("Stale driver info for ride {} ignored", ride_id);
            return false;
        }

        advance(&mut entry.ride.last_event_at, at);
        entry.ride.driver_info = Some(driver);
        entry.publish();
        true
    }

    /// Folds a poll result in through the same entry points as push events.
    /// Status goes first so server timestamps are judged before anything else
    /// in the snapshot moves the event clock; the driver carries the snapshot's
    /// server time.
    pub fn apply_snapshot(&self, ride_id: &RideId, snapshot: &TrackingSnapshot) -> SnapshotMerge {
        let mut merge = SnapshotMerge::default();
        if let Some((status, at)) = snapshot.status {
            merge.status = self.apply_status(ride_id, status, at);
        }
        if let Some(location) = &snapshot.location {
            merge.location = self.apply_location(ride_id, location.clone());
        }
        if let Some(driver) = &snapshot.driver {
            merge.driver = self.apply_driver(ride_id, driver.clone(), snapshot.server_time());
        }
        merge
    }
}

fn is_older(ride: &TrackedRide, at: DateTime<Utc>) -> bool {
    matches!(ride.last_event_at, Some(last) if at < last)
}

fn advance(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    match slot {
        Some(last) if *last >= at => false,
        _ => {
            *slot = Some(at);
            true
        }
    }
}
