//! Real-time ride tracking client: a push transport with reconnect, pull
//! fallback polling, a freshness-checked tracking store and a bounded queue of
//! user-facing notifications.

pub mod api;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod notifications;
pub mod poller;
pub mod processor;
pub mod session;
pub mod store;
pub mod transport;

pub use channel::{ChannelSettings, LiveRideChannel, RideObservation};
pub use connection::{ConnectionSession, ConnectionState};
pub use models::{Notification, RideId, RideStatus, TrackedRide};
pub use session::{Credentials, SessionContext};
