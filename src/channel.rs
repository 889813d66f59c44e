//! Public entry point: observe a ride, get a live snapshot feed and a
//! notification feed, stop observing.
//!
//! Each observed ride gets its own connection manager, one poll loop per
//! enabled tier and a reaper that tears the ride down once it has been
//! terminal for the grace period. Push and poll results meet only in the
//! tracking store.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::TrackingSource;
use crate::connection::{
    ConnectionManager, ConnectionSession, ConnectionState, EventHandlers, ReconnectPolicy,
};
use crate::models::{
    DriverInfo, Location, Notification, NotificationId, NotificationRequest, RideId, RideStatus,
    TrackedRide, TrackingSnapshot,
};
use crate::notifications::NotificationQueue;
use crate::poller::{MergeCallback, PollContext, PollSettings, Poller};
use crate::session::SessionContext;
use crate::store::{SnapshotMerge, TrackingStore};
use crate::transport::Connector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub reconnect: ReconnectPolicy,
    pub polling: PollSettings,
    /// How long a completed or cancelled ride stays observable.
    pub terminal_grace: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            polling: PollSettings::default(),
            terminal_grace: Duration::from_secs(30),
        }
    }
}

/// Live feeds for one observed ride.
#[derive(Clone)]
pub struct RideObservation {
    pub state: watch::Receiver<Option<TrackedRide>>,
    pub notifications: watch::Receiver<Vec<Notification>>,
    pub connection: watch::Receiver<ConnectionSession>,
}

struct RideHandle {
    connection: ConnectionManager,
    pollers: Vec<Poller>,
    reaper: CancellationToken,
    unavailable_notice: Arc<Mutex<Option<NotificationId>>>,
}

impl RideHandle {
    /// Leaves no task running and no persistent notice behind for the ride.
    fn shutdown(self, notifications: &NotificationQueue) {
        self.reaper.cancel();
        self.connection.reset();
        self.connection.disconnect();
        for poller in &self.pollers {
            poller.stop();
        }
        if let Some(id) = self.unavailable_notice.lock().take() {
            notifications.dismiss(id);
        }
    }
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    source: Option<Arc<dyn TrackingSource>>,
    session: SessionContext,
    store: TrackingStore,
    notifications: NotificationQueue,
    settings: ChannelSettings,
    handlers: RwLock<EventHandlers>,
    rides: Mutex<HashMap<RideId, RideHandle>>,
}

#[derive(Clone)]
pub struct LiveRideChannel {
    inner: Arc<ChannelInner>,
}

impl LiveRideChannel {
    /// `source` is the pull endpoint; without it no poll tier runs regardless
    /// of `settings.polling`.
    pub fn new(
        connector: Arc<dyn Connector>,
        source: Option<Arc<dyn TrackingSource>>,
        session: SessionContext,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                source,
                session,
                store: TrackingStore::new(),
                notifications: NotificationQueue::new(),
                settings,
                handlers: RwLock::new(EventHandlers::default()),
                rides: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &TrackingStore {
        &self.inner.store
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.inner.notifications
    }

    pub fn snapshot(&self, ride_id: &RideId) -> Option<TrackedRide> {
        self.inner.store.snapshot(ride_id)
    }

    pub fn connection(&self, ride_id: &RideId) -> Option<ConnectionSession> {
        self.inner
            .rides
            .lock()
            .get(ride_id)
            .map(|r| r.connection.session())
    }

    pub fn is_observing(&self, ride_id: &RideId) -> bool {
        self.inner.rides.lock().contains_key(ride_id)
    }

    pub fn dismiss(&self, id: NotificationId) -> bool {
        self.inner.notifications.dismiss(id)
    }

    fn polling_enabled(&self) -> bool {
        self.inner.source.is_some() && self.inner.settings.polling.is_enabled()
    }

    /// Begins tracking `ride_id`. Observing an already observed ride returns
    /// fresh feeds, re-opens its transport if it was closed and resumes
    /// suspended poll loops.
    pub fn observe(&self, ride_id: &RideId) -> RideObservation {
        let existing = self.inner.rides.lock().get(ride_id).map(|r| {
            let suspended = r.pollers.iter().any(Poller::is_finished);
            (r.connection.clone(), suspended)
        });
        if let Some((connection, suspended)) = existing {
            if suspended {
                debug!("Resuming polls for ride {}", ride_id);
                let pollers = self.spawn_pollers(ride_id);
                if let Some(ride) = self.inner.rides.lock().get_mut(ride_id) {
                    ride.pollers = pollers;
                }
            }
            self.connect(ride_id, &connection);
            return self.observation(ride_id, &connection);
        }

        info!("Observing ride {}", ride_id);
        let state = self.inner.store.track(ride_id);

        let connection = ConnectionManager::new(
            self.inner.connector.clone(),
            self.inner.settings.reconnect.clone(),
            self.inner.notifications.clone(),
        );
        let unavailable_notice = Arc::new(Mutex::new(None));
        {
            let mut handlers = connection.handlers();
            handlers.extend(&self.internal_handlers(unavailable_notice.clone()));
            handlers.extend(&self.inner.handlers.read());
        }

        let pollers = self.spawn_pollers(ride_id);
        let reaper = self.spawn_reaper(ride_id, state.clone());

        let handle = RideHandle {
            connection: connection.clone(),
            pollers,
            reaper,
            unavailable_notice,
        };
        let displaced = self.inner.rides.lock().insert(ride_id.clone(), handle);
        if let Some(displaced) = displaced {
            debug!("Concurrent observe for ride {}, replacing handle", ride_id);
            displaced.shutdown(&self.inner.notifications);
        }

        self.connect(ride_id, &connection);

        RideObservation {
            state,
            notifications: self.inner.notifications.subscribe(),
            connection: connection.watch(),
        }
    }

    /// Tears down push and poll activity for `ride_id` and forgets its state.
    pub fn stop_observing(&self, ride_id: &RideId) -> bool {
        let handle = self.inner.rides.lock().remove(ride_id);
        match handle {
            Some(handle) => {
                info!("Stopped observing ride {}", ride_id);
                handle.shutdown(&self.inner.notifications);
                self.inner.store.untrack(ride_id);
                true
            }
            None => false,
        }
    }

    /// Manual retry after the connection gave up.
    pub fn reconnect(&self, ride_id: &RideId) {
        let connection = self
            .inner
            .rides
            .lock()
            .get(ride_id)
            .map(|r| r.connection.clone());
        if let Some(connection) = connection {
            connection.reset();
            self.connect(ride_id, &connection);
        }
    }

    pub fn on_location(&self, f: impl Fn(&RideId, &Location) + Send + Sync + 'static) {
        let mut handlers = EventHandlers::default();
        handlers.on_location(f);
        self.register(handlers);
    }

    pub fn on_status(&self, f: impl Fn(&RideId, RideStatus, DateTime<Utc>) + Send + Sync + 'static) {
        let mut handlers = EventHandlers::default();
        handlers.on_status(f);
        self.register(handlers);
    }

    pub fn on_driver_assigned(
        &self,
        f: impl Fn(&RideId, &DriverInfo, DateTime<Utc>) + Send + Sync + 'static,
    ) {
        let mut handlers = EventHandlers::default();
        handlers.on_driver_assigned(f);
        self.register(handlers);
    }

    pub fn on_ride_started(&self, f: impl Fn(&RideId, DateTime<Utc>) + Send + Sync + 'static) {
        let mut handlers = EventHandlers::default();
        handlers.on_ride_started(f);
        self.register(handlers);
    }

    pub fn on_ride_completed(&self, f: impl Fn(&RideId, DateTime<Utc>) + Send + Sync + 'static) {
        let mut handlers = EventHandlers::default();
        handlers.on_ride_completed(f);
        self.register(handlers);
    }

    pub fn on_connection_state(
        &self,
        f: impl Fn(&RideId, &ConnectionSession) + Send + Sync + 'static,
    ) {
        let mut handlers = EventHandlers::default();
        handlers.on_state_change(f);
        self.register(handlers);
    }

    fn register(&self, handlers: EventHandlers) {
        self.inner.handlers.write().extend(&handlers);
        let connections: Vec<ConnectionManager> = self
            .inner
            .rides
            .lock()
            .values()
            .map(|r| r.connection.clone())
            .collect();
        for connection in connections {
            connection.handlers().extend(&handlers);
        }
    }

    fn observation(&self, ride_id: &RideId, connection: &ConnectionManager) -> RideObservation {
        let state = self
            .inner
            .store
            .subscribe(ride_id)
            .unwrap_or_else(|| self.inner.store.track(ride_id));
        RideObservation {
            state,
            notifications: self.inner.notifications.subscribe(),
            connection: connection.watch(),
        }
    }

    fn connect(&self, ride_id: &RideId, connection: &ConnectionManager) {
        match self.inner.session.credentials() {
            Some(credentials) => connection.connect(ride_id, credentials),
            None => warn!("Not signed in, live tracking for ride {} not started", ride_id),
        }
    }

    /// Folds push events into the store and announces accepted transitions.
    fn internal_handlers(
        &self,
        unavailable_notice: Arc<Mutex<Option<NotificationId>>>,
    ) -> EventHandlers {
        let mut handlers = EventHandlers::default();

        let (store, queue) = (self.inner.store.clone(), self.inner.notifications.clone());
        handlers.on_location(move |ride_id, location| {
            if store.apply_location(ride_id, location.clone()) {
                queue.push(NotificationRequest::location_updated(
                    location.speed_meters_per_second,
                ));
            }
        });

        let (store, queue) = (self.inner.store.clone(), self.inner.notifications.clone());
        handlers.on_status(move |ride_id, status, at| {
            if store.apply_status(ride_id, status, at) {
                announce_status(&queue, status);
            }
        });

        let (store, queue) = (self.inner.store.clone(), self.inner.notifications.clone());
        handlers.on_driver_assigned(move |ride_id, driver, at| {
            if store.apply_driver(ride_id, driver.clone(), at) {
                queue.push(NotificationRequest::driver_assigned(&driver.name));
            }
        });

        let (store, queue) = (self.inner.store.clone(), self.inner.notifications.clone());
        handlers.on_ride_started(move |ride_id, at| {
            if store.apply_status(ride_id, RideStatus::InProgress, at) {
                announce_status(&queue, RideStatus::InProgress);
            }
        });

        let (store, queue) = (self.inner.store.clone(), self.inner.notifications.clone());
        handlers.on_ride_completed(move |ride_id, at| {
            if store.apply_status(ride_id, RideStatus::Completed, at) {
                announce_status(&queue, RideStatus::Completed);
            }
        });

        let queue = self.inner.notifications.clone();
        let polling = self.polling_enabled();
        handlers.on_state_change(move |ride_id, session| {
            debug!("Ride {} connection {}", ride_id, session.state);
            match session.state {
                ConnectionState::Failed if !polling => {
                    warn!("Live tracking unavailable for ride {}", ride_id);
                    let id = queue.push(NotificationRequest::tracking_unavailable());
                    if let Some(stale) = unavailable_notice.lock().replace(id) {
                        queue.dismiss(stale);
                    }
                }
                ConnectionState::Connected => {
                    if let Some(id) = unavailable_notice.lock().take() {
                        queue.dismiss(id);
                    }
                }
                _ => {}
            }
        });

        handlers
    }

    fn spawn_pollers(&self, ride_id: &RideId) -> Vec<Poller> {
        let Some(source) = &self.inner.source else {
            return Vec::new();
        };

        let queue = self.inner.notifications.clone();
        let on_merge: MergeCallback = Arc::new(
            move |_: &RideId, snapshot: &TrackingSnapshot, merge: SnapshotMerge| {
                if merge.driver {
                    if let Some(driver) = &snapshot.driver {
                        queue.push(NotificationRequest::driver_assigned(&driver.name));
                    }
                }
                if merge.status {
                    if let Some((status, _)) = snapshot.status {
                        announce_status(&queue, status);
                    }
                }
            },
        );

        let ctx = PollContext {
            source: source.clone(),
            session: self.inner.session.clone(),
            store: self.inner.store.clone(),
            notifications: self.inner.notifications.clone(),
            failure_threshold: self.inner.settings.polling.failure_threshold,
            on_merge: Some(on_merge),
        };

        self.inner
            .settings
            .polling
            .tiers()
            .into_iter()
            .map(|(tier, period)| Poller::spawn(ride_id.clone(), tier, period, ctx.clone()))
            .collect()
    }

    /// Stops observing the ride once it has been terminal for the grace period.
    fn spawn_reaper(
        &self,
        ride_id: &RideId,
        mut state: watch::Receiver<Option<TrackedRide>>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let channel = self.clone();
        let ride_id = ride_id.clone();
        let grace = self.inner.settings.terminal_grace;

        tokio::spawn(async move {
            let status = loop {
                let current = state.borrow_and_update().as_ref().map(|r| r.ride_status);
                match current {
                    None => return,
                    Some(status) if status.is_terminal() => break status,
                    Some(_) => {}
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            };

            info!("Ride {} is {}, releasing in {:?}", ride_id, status, grace);
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    channel.stop_observing(&ride_id);
                }
            }
        });

        cancel
    }
}

fn announce_status(queue: &NotificationQueue, status: RideStatus) {
    match status {
        RideStatus::InProgress => {
            queue.push(NotificationRequest::ride_started());
        }
        RideStatus::Completed => {
            queue.push(NotificationRequest::ride_completed());
        }
        _ => {}
    }
}
