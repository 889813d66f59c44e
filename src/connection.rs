//! Lifecycle of the push transport for one ride.
//!
//! `connect` spawns a supervisor task that opens the transport, pumps frames
//! through the decoder and reconnects with linear, capped backoff. Every state
//! change goes through `Shared::transition`, which ignores supervisors from an
//! older generation, so nothing a stale task does can outlive `disconnect`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, DecodeError, TransportError};
use crate::models::{DriverInfo, Location, NotificationId, NotificationRequest, RideId, RideStatus};
use crate::notifications::NotificationQueue;
use crate::processor::{decode, RideEvent};
use crate::session::Credentials;
use crate::transport::{ConnectRequest, Connector, Frame, Link, MANUAL_CLOSE_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSession {
    pub state: ConnectionState,
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base_delay * attempt, max_delay)`, never below `base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay.max(self.base_delay))
    }
}

type LocationCallback = Arc<dyn Fn(&RideId, &Location) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(&RideId, RideStatus, DateTime<Utc>) + Send + Sync>;
type DriverCallback = Arc<dyn Fn(&RideId, &DriverInfo, DateTime<Utc>) + Send + Sync>;
type MarkerCallback = Arc<dyn Fn(&RideId, DateTime<Utc>) + Send + Sync>;
type StateCallback = Arc<dyn Fn(&RideId, &ConnectionSession) + Send + Sync>;

/// Subscriber callbacks, one list per event kind plus connection transitions.
#[derive(Clone, Default)]
pub struct EventHandlers {
    location: Vec<LocationCallback>,
    status: Vec<StatusCallback>,
    driver: Vec<DriverCallback>,
    ride_started: Vec<MarkerCallback>,
    ride_completed: Vec<MarkerCallback>,
    state: Vec<StateCallback>,
}

impl EventHandlers {
    pub fn on_location(&mut self, f: impl Fn(&RideId, &Location) + Send + Sync + 'static) {
        self.location.push(Arc::new(f));
    }

    pub fn on_status(&mut self, f: impl Fn(&RideId, RideStatus, DateTime<Utc>) + Send + Sync + 'static) {
        self.status.push(Arc::new(f));
    }

    pub fn on_driver_assigned(
        &mut self,
        f: impl Fn(&RideId, &DriverInfo, DateTime<Utc>) + Send + Sync + 'static,
    ) {
        self.driver.push(Arc::new(f));
    }

    pub fn on_ride_started(&mut self, f: impl Fn(&RideId, DateTime<Utc>) + Send + Sync + 'static) {
        self.ride_started.push(Arc::new(f));
    }

    pub fn on_ride_completed(&mut self, f: impl Fn(&RideId, DateTime<Utc>) + Send + Sync + 'static) {
        self.ride_completed.push(Arc::new(f));
    }

    pub fn on_state_change(
        &mut self,
        f: impl Fn(&RideId, &ConnectionSession) + Send + Sync + 'static,
    ) {
        self.state.push(Arc::new(f));
    }

    /// Appends every callback of `other`.
    pub fn extend(&mut self, other: &EventHandlers) {
        self.location.extend(other.location.iter().cloned());
        self.status.extend(other.status.iter().cloned());
        self.driver.extend(other.driver.iter().cloned());
        self.ride_started.extend(other.ride_started.iter().cloned());
        self.ride_completed.extend(other.ride_completed.iter().cloned());
        self.state.extend(other.state.iter().cloned());
    }

    pub fn dispatch(&self, ride_id: &RideId, event: &RideEvent) {
        match event {
            RideEvent::LocationUpdate(location) => {
                self.location.iter().for_each(|f| f(ride_id, location))
            }
            RideEvent::StatusChange { status, at } => {
                self.status.iter().for_each(|f| f(ride_id, *status, *at))
            }
            RideEvent::DriverAssigned { driver, at } => {
                self.driver.iter().for_each(|f| f(ride_id, driver, *at))
            }
            RideEvent::RideStarted { at } => self.ride_started.iter().for_each(|f| f(ride_id, *at)),
            RideEvent::RideCompleted { at } => {
                self.ride_completed.iter().for_each(|f| f(ride_id, *at))
            }
        }
    }

    fn notify_state(&self, ride_id: &RideId, session: &ConnectionSession) {
        self.state.iter().for_each(|f| f(ride_id, session));
    }
}

struct Control {
    session: ConnectionSession,
    ride_id: Option<RideId>,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    lost_notice: Option<NotificationId>,
    exhausted_notice: Option<NotificationId>,
    had_outage: bool,
}

struct Shared {
    control: Mutex<Control>,
    state_tx: watch::Sender<ConnectionSession>,
    handlers: RwLock<EventHandlers>,
    notifications: NotificationQueue,
}

impl Shared {
    /// Applies `f` if `generation` is still current, then publishes the new
    /// session and runs state callbacks outside the lock.
    fn transition(&self, generation: u64, f: impl FnOnce(&mut Control)) -> Option<ConnectionSession> {
        let (ride_id, session) = {
            let mut control = self.control.lock();
            if control.generation != generation {
                return None;
            }
            f(&mut control);
            self.state_tx.send_replace(control.session.clone());
            (control.ride_id.clone(), control.session.clone())
        };
        if let Some(ride_id) = ride_id {
            let handlers = self.handlers.read().clone();
            handlers.notify_state(&ride_id, &session);
        }
        Some(session)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.control.lock().generation == generation
    }
}

/// Owns at most one live transport at a time. Cloning shares the manager.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        notifications: NotificationQueue,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionSession::default());
        Self {
            connector,
            policy,
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    session: ConnectionSession::default(),
                    ride_id: None,
                    generation: 0,
                    cancel: None,
                    task: None,
                    lost_notice: None,
                    exhausted_notice: None,
                    had_outage: false,
                }),
                state_tx,
                handlers: RwLock::new(EventHandlers::default()),
                notifications,
            }),
        }
    }

    pub fn handlers(&self) -> parking_lot::RwLockWriteGuard<'_, EventHandlers> {
        self.shared.handlers.write()
    }

    pub fn session(&self) -> ConnectionSession {
        self.shared.control.lock().session.clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSession> {
        self.shared.state_tx.subscribe()
    }

    pub fn ride_id(&self) -> Option<RideId> {
        self.shared.control.lock().ride_id.clone()
    }

    /// Opens the transport for `ride_id`. A no-op while a session for the same
    /// ride is connecting, connected or waiting to reconnect, and while `Failed`.
    pub fn connect(&self, ride_id: &RideId, credentials: Credentials) {
        let (generation, cancel, session) = {
            let mut control = self.shared.control.lock();
            let active = matches!(
                control.session.state,
                ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Reconnecting
            );
            if active && control.ride_id.as_ref() == Some(ride_id) {
                debug!("Connect for ride {} ignored: already {}", ride_id, control.session.state);
                return;
            }
            if control.session.state == ConnectionState::Failed {
                warn!("Connect for ride {} ignored: session failed, reset required", ride_id);
                return;
            }
            if active {
                info!(
                    "Switching tracking socket from ride {:?} to {}",
                    control.ride_id, ride_id
                );
                if let Some(token) = control.cancel.take() {
                    token.cancel();
                }
            }

            control.generation += 1;
            let cancel = CancellationToken::new();
            control.cancel = Some(cancel.clone());
            control.ride_id = Some(ride_id.clone());
            control.had_outage = false;
            control.session = ConnectionSession {
                state: ConnectionState::Connecting,
                attempt: 0,
                last_error: None,
            };
            self.shared.state_tx.send_replace(control.session.clone());
            (control.generation, cancel, control.session.clone())
        };
        let handlers = self.shared.handlers.read().clone();
        handlers.notify_state(ride_id, &session);

        let supervisor = Supervisor {
            connector: self.connector.clone(),
            policy: self.policy.clone(),
            shared: self.shared.clone(),
            request: ConnectRequest {
                ride_id: ride_id.clone(),
                credentials,
            },
            generation,
            cancel,
        };
        let handle = tokio::spawn(supervisor.run());

        let mut control = self.shared.control.lock();
        if control.generation == generation {
            control.task = Some(handle);
        }
    }

    /// Closes the transport with the manual close code and cancels any pending
    /// reconnect. Idempotent. A `Failed` session stays failed until `reset`.
    pub fn disconnect(&self) {
        let changed = {
            let mut control = self.shared.control.lock();
            control.generation += 1;
            if let Some(token) = control.cancel.take() {
                token.cancel();
            }
            control.task.take();
            if let Some(id) = control.lost_notice.take() {
                self.shared.notifications.dismiss(id);
            }
            control.had_outage = false;

            if matches!(
                control.session.state,
                ConnectionState::Disconnected | ConnectionState::Failed
            ) {
                None
            } else {
                control.session = ConnectionSession::default();
                self.shared.state_tx.send_replace(control.session.clone());
                control.ride_id.clone().map(|r| (r, control.session.clone()))
            }
        };

        if let Some((ride_id, session)) = changed {
            info!("Tracking socket for ride {} disconnected", ride_id);
            let handlers = self.shared.handlers.read().clone();
            handlers.notify_state(&ride_id, &session);
        }
    }

    /// Leaves `Failed` so `connect` may be called again.
    pub fn reset(&self) {
        let changed = {
            let mut control = self.shared.control.lock();
            if control.session.state != ConnectionState::Failed {
                return;
            }
            control.generation += 1;
            if let Some(id) = control.exhausted_notice.take() {
                self.shared.notifications.dismiss(id);
            }
            control.session = ConnectionSession::default();
            self.shared.state_tx.send_replace(control.session.clone());
            control.ride_id.clone().map(|r| (r, control.session.clone()))
        };

        if let Some((ride_id, session)) = changed {
            let handlers = self.shared.handlers.read().clone();
            handlers.notify_state(&ride_id, &session);
        }
    }
}

enum LinkOutcome {
    Cancelled,
    ClosedNormally,
    Lost(TransportError),
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    request: ConnectRequest,
    generation: u64,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let ride_id = self.request.ride_id.clone();
        let mut first_attempt = true;

        loop {
            if !first_attempt
                && self
                    .shared
                    .transition(self.generation, |c| {
                        c.session.state = ConnectionState::Connecting;
                    })
                    .is_none()
            {
                return;
            }
            first_attempt = false;

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = tokio::time::timeout(
                    self.policy.connect_timeout,
                    self.connector.connect(&self.request),
                ) => result,
            };

            let failure = match attempt {
                Ok(Ok(mut link)) => {
                    if self.on_open().is_none() {
                        link.close(MANUAL_CLOSE_CODE).await;
                        return;
                    }
                    match self.pump(link.as_mut()).await {
                        LinkOutcome::Cancelled => {
                            link.close(MANUAL_CLOSE_CODE).await;
                            return;
                        }
                        LinkOutcome::ClosedNormally => {
                            info!("Tracking socket for ride {} closed by server", ride_id);
                            self.shared.transition(self.generation, |c| {
                                c.session = ConnectionSession::default();
                            });
                            return;
                        }
                        LinkOutcome::Lost(e) => e,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(self.policy.connect_timeout.as_millis() as u64),
            };

            warn!("Tracking socket for ride {} lost: {}", ride_id, failure);

            let Some(session) = self.on_failure(&failure) else {
                return;
            };
            if session.state == ConnectionState::Failed {
                return;
            }

            let delay = self.policy.backoff(session.attempt);
            info!(
                "Reconnecting ride {} in {:?} (attempt {}/{})",
                ride_id, delay, session.attempt, self.policy.max_attempts
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn on_open(&self) -> Option<ConnectionSession> {
        let notifications = &self.shared.notifications;
        let session = self.shared.transition(self.generation, |c| {
            if c.had_outage {
                if let Some(id) = c.lost_notice.take() {
                    notifications.dismiss(id);
                }
                notifications.push(NotificationRequest::connection_restored());
                c.had_outage = false;
            }
            c.session = ConnectionSession {
                state: ConnectionState::Connected,
                attempt: 0,
                last_error: None,
            };
        });
        if session.is_some() {
            info!("Tracking socket for ride {} connected", self.request.ride_id);
        }
        session
    }

    fn on_failure(&self, failure: &TransportError) -> Option<ConnectionSession> {
        let notifications = &self.shared.notifications;
        let max_attempts = self.policy.max_attempts;
        self.shared.transition(self.generation, |c| {
            c.session.attempt += 1;
            c.session.last_error = Some(failure.to_string());

            if c.session.attempt > max_attempts {
                let exhausted = ChannelError::ExhaustedRetries {
                    attempts: max_attempts,
                };
                error!("Ride {}: {}", self.request.ride_id, exhausted);
                c.session.state = ConnectionState::Failed;
                if let Some(id) = c.lost_notice.take() {
                    notifications.dismiss(id);
                }
                c.exhausted_notice =
                    Some(notifications.push(NotificationRequest::reconnect_exhausted(max_attempts)));
                return;
            }

            c.session.state = ConnectionState::Reconnecting;
            c.had_outage = true;
            let showing = c.lost_notice.map_or(false, |id| notifications.contains(id));
            if !showing {
                c.lost_notice = Some(notifications.push(NotificationRequest::connection_lost()));
            }
        })
    }

    async fn pump(&self, link: &mut dyn Link) -> LinkOutcome {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return LinkOutcome::Cancelled,
                frame = link.recv() => frame,
            };

            match frame {
                Ok(Frame::Text(text)) => self.deliver(text.as_bytes()),
                Ok(Frame::Binary(bytes)) => self.deliver(&bytes),
                Ok(Frame::Closed { code, .. }) if code == MANUAL_CLOSE_CODE => {
                    return LinkOutcome::ClosedNormally
                }
                Ok(Frame::Closed { code, reason }) => {
                    return LinkOutcome::Lost(TransportError::Closed { code, reason })
                }
                Err(e) => return LinkOutcome::Lost(e),
            }
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let ride_id = &self.request.ride_id;
        let event = match decode(payload, ride_id, Utc::now()) {
            Ok(event) => event,
            Err(e @ DecodeError::Malformed(_)) => {
                warn!("Dropping tracking message for ride {}: {}", ride_id, e);
                return;
            }
            Err(e) => {
                debug!("Dropping tracking message for ride {}: {}", ride_id, e);
                return;
            }
        };

        if !self.shared.is_current(self.generation) {
            return;
        }
        debug!("Ride {} event: {}", ride_id, event.kind());
        let handlers = self.shared.handlers.read().clone();
        handlers.dispatch(ride_id, &event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    pub enum Script {
        Fail(TransportError),
        Hang,
        Open(mpsc::UnboundedReceiver<Frame>),
    }

    /// Connector that replays a script of outcomes, one per `connect` call.
    #[derive(Clone, Default)]
    pub struct ScriptedConnector {
        pub scripts: Arc<Mutex<VecDeque<Script>>>,
        pub attempts: Arc<Mutex<Vec<Instant>>>,
        pub close_codes: Arc<Mutex<Vec<u16>>>,
    }

    impl ScriptedConnector {
        pub fn push(&self, script: Script) {
            self.scripts.lock().push_back(script);
        }

        /// Queues an open link and returns the sender feeding it.
        pub fn open(&self) -> mpsc::UnboundedSender<Frame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.push(Script::Open(rx));
            tx
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().len()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _request: &ConnectRequest) -> Result<Box<dyn Link>, TransportError> {
            self.attempts.lock().push(Instant::now());
            let script = self.scripts.lock().pop_front();
            match script {
                Some(Script::Open(rx)) => Ok(Box::new(ScriptedLink {
                    rx,
                    close_codes: self.close_codes.clone(),
                })),
                Some(Script::Hang) => std::future::pending().await,
                Some(Script::Fail(e)) => Err(e),
                None => Err(TransportError::Connect("connection refused".to_string())),
            }
        }
    }

    struct ScriptedLink {
        rx: mpsc::UnboundedReceiver<Frame>,
        close_codes: Arc<Mutex<Vec<u16>>>,
    }

    #[async_trait]
    impl Link for ScriptedLink {
        async fn recv(&mut self) -> Result<Frame, TransportError> {
            match self.rx.recv().await {
                Some(frame) => Ok(frame),
                None => Err(TransportError::Protocol("connection reset".to_string())),
            }
        }

        async fn close(&mut self, code: u16) {
            self.close_codes.lock().push(code);
        }
    }

    pub async fn wait_for_state(
        rx: &mut watch::Receiver<ConnectionSession>,
        state: ConnectionState,
    ) -> ConnectionSession {
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .expect("manager dropped")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::Category;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(2500),
            max_attempts: 3,
            connect_timeout: Duration::from_millis(5000),
        }
    }

    fn creds() -> Credentials {
        Credentials::new("u1", "rider", "token")
    }

    fn ride() -> RideId {
        RideId::new("R1")
    }

    fn manager(connector: &ScriptedConnector) -> (ConnectionManager, NotificationQueue) {
        let queue = NotificationQueue::new();
        let manager = ConnectionManager::new(Arc::new(connector.clone()), policy(), queue.clone());
        (manager, queue)
    }

    fn record_states(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        manager
            .handlers()
            .on_state_change(move |_, session| sink.lock().push(session.state));
        states
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2500));
        assert_eq!(policy.backoff(40), Duration::from_millis(2500));
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn routes_decoded_events_to_callbacks() {
        let connector = ScriptedConnector::default();
        let tx = connector.open();
        let (manager, _) = manager(&connector);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let mut handlers = manager.handlers();
            let sink = seen.clone();
            handlers.on_location(move |_, loc| sink.lock().push(format!("loc {}", loc.latitude)));
            let sink = seen.clone();
            handlers.on_driver_assigned(move |_, d, _| sink.lock().push(format!("driver {}", d.name)));
            let sink = seen.clone();
            handlers.on_ride_completed(move |_, _| sink.lock().push("completed".to_string()));
        }

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        tx.send(Frame::Text("{not json".to_string())).unwrap();
        tx.send(Frame::Text(r#"{"type":"mystery","data":{}}"#.to_string())).unwrap();
        tx.send(Frame::Text(r#"{"type":"location_update","data":{"lat":1,"lng":2}}"#.to_string()))
            .unwrap();
        tx.send(Frame::Text(r#"{"type":"driver_assigned","data":{"name":"Sam"}}"#.to_string()))
            .unwrap();
        tx.send(Frame::Binary(br#"{"type":"ride_completed"}"#.to_vec())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec!["loc 1", "driver Sam", "completed"]);
        assert_eq!(manager.session().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_active() {
        let connector = ScriptedConnector::default();
        let _tx = connector.open();
        let (manager, _) = manager(&connector);

        manager.connect(&ride(), creds());
        manager.connect(&ride(), creds());
        let mut rx = manager.watch();
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        manager.connect(&ride(), creds());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_follow_the_backoff_policy() {
        let connector = ScriptedConnector::default();
        for _ in 0..3 {
            connector.push(Script::Fail(TransportError::Connect("refused".to_string())));
        }
        let _tx = connector.open();
        let (manager, _) = manager(&connector);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        let attempts = connector.attempts.lock().clone();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(2500)
            ]
        );
        assert_eq!(manager.session().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_until_reset() {
        let connector = ScriptedConnector::default();
        let (manager, queue) = manager(&connector);
        let states = record_states(&manager);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        let failed = wait_for_state(&mut rx, ConnectionState::Failed).await;

        assert_eq!(failed.attempt, 4);
        assert_eq!(connector.attempt_count(), 4);
        assert!(failed.last_error.is_some());
        assert_eq!(states.lock().last(), Some(&ConnectionState::Failed));

        let titles: Vec<String> = queue.list().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Live Tracking Paused"]);

        manager.connect(&ride(), creds());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempt_count(), 4);

        manager.reset();
        assert_eq!(manager.session(), ConnectionSession::default());
        assert!(queue.list().is_empty());

        let _tx = connector.open();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_a_pending_reconnect() {
        let connector = ScriptedConnector::default();
        connector.push(Script::Fail(TransportError::Connect("refused".to_string())));
        let _tx = connector.open();
        let (manager, queue) = manager(&connector);
        let states = record_states(&manager);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Reconnecting).await;
        assert_eq!(queue.list().len(), 1);

        manager.disconnect();
        let transitions_at_disconnect = states.lock().len();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(manager.session(), ConnectionSession::default());
        let after: Vec<ConnectionState> = states.lock()[transitions_at_disconnect..].to_vec();
        assert!(after.is_empty(), "unexpected transitions {after:?}");
        assert!(queue.list().is_empty());

        manager.disconnect();
        assert_eq!(states.lock().len(), transitions_at_disconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_closes_with_manual_code() {
        let connector = ScriptedConnector::default();
        let _tx = connector.open();
        let (manager, _) = manager(&connector);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*connector.close_codes.lock(), vec![MANUAL_CLOSE_CODE]);
        assert_eq!(manager.session().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_shows_lost_then_restored() {
        let connector = ScriptedConnector::default();
        let tx = connector.open();
        let _tx2 = connector.open();
        let (manager, queue) = manager(&connector);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        assert!(queue.list().is_empty());

        tx.send(Frame::Closed {
            code: 1011,
            reason: "server error".to_string(),
        })
        .unwrap();
        let reconnecting = wait_for_state(&mut rx, ConnectionState::Reconnecting).await;
        assert_eq!(reconnecting.attempt, 1);

        let lost = queue.list();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].title, "Connection Lost");
        assert_eq!(lost[0].category, Category::Warning);
        assert!(!lost[0].auto_close());

        wait_for_state(&mut rx, ConnectionState::Connected).await;
        let titles: Vec<String> = queue.list().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Connection Restored"]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_with_manual_code_does_not_reconnect() {
        let connector = ScriptedConnector::default();
        let tx = connector.open();
        let (manager, queue) = manager(&connector);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        tx.send(Frame::Closed {
            code: MANUAL_CLOSE_CODE,
            reason: String::new(),
        })
        .unwrap();
        wait_for_state(&mut rx, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempt_count(), 1);
        assert!(queue.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_times_out_into_backoff() {
        let connector = ScriptedConnector::default();
        connector.push(Script::Hang);
        let _tx = connector.open();
        let (manager, _) = manager(&connector);

        let mut rx = manager.watch();
        manager.connect(&ride(), creds());
        let reconnecting = wait_for_state(&mut rx, ConnectionState::Reconnecting).await;
        assert_eq!(
            reconnecting.last_error.as_deref(),
            Some("Connection attempt timed out after 5000 ms")
        );

        wait_for_state(&mut rx, ConnectionState::Connected).await;
        let attempts = connector.attempts.lock().clone();
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(6000));
    }
}
