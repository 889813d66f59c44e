pub mod message;
pub mod notification;
pub mod ride;
pub mod snapshot;

pub use notification::{Category, Notification, NotificationId, NotificationRequest};
pub use ride::{DriverInfo, Location, RideId, RideStatus, TrackedRide};
pub use snapshot::TrackingSnapshot;
