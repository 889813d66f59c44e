use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

pub type NotificationId = Uuid;

pub const DEFAULT_DURATION: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Location,
    Status,
    Success,
    Warning,
}

/// A notification before it is queued. `duration == None` means dismiss-only.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub category: Category,
    pub title: String,
    pub message: String,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub category: Category,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn auto_close(&self) -> bool {
        self.expires_at.is_some()
    }
}

impl NotificationRequest {
    pub fn new(category: Category, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            title: title.into(),
            message: message.into(),
            duration: Some(DEFAULT_DURATION),
        }
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn driver_assigned(driver_name: &str) -> Self {
        Self::new(
            Category::Success,
            "Driver Assigned",
            format!("{driver_name} has been assigned to your ride"),
        )
        .lasting(Duration::from_millis(6000))
    }

    pub fn ride_started() -> Self {
        Self::new(
            Category::Status,
            "Ride Started",
            "Your driver has started the trip. Live tracking is now active.",
        )
        .lasting(Duration::from_millis(6000))
    }

    pub fn location_updated(speed: Option<f64>) -> Self {
        let speed_text = match speed {
            Some(s) if s > 0.0 => format!(" ({} mph)", s.round() as i64),
            _ => String::new(),
        };
        Self::new(
            Category::Location,
            "Location Updated",
            format!("Driver location updated{speed_text}"),
        )
        .lasting(Duration::from_millis(3000))
    }

    pub fn ride_completed() -> Self {
        Self::new(
            Category::Success,
            "Ride Completed",
            "Your ride has been completed. Thank you for riding with us!",
        )
        .lasting(Duration::from_millis(8000))
    }

    pub fn connection_lost() -> Self {
        Self::new(
            Category::Warning,
            "Connection Lost",
            "Lost connection to live tracking. Trying to reconnect...",
        )
        .persistent()
    }

    pub fn connection_restored() -> Self {
        Self::new(
            Category::Success,
            "Connection Restored",
            "Live tracking connection restored",
        )
        .lasting(Duration::from_millis(4000))
    }

    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::new(
            Category::Warning,
            "Live Tracking Paused",
            format!(
                "Could not reconnect after {attempts} attempts. Refresh the page or retry to resume live updates."
            ),
        )
        .persistent()
    }

    pub fn tracking_unavailable() -> Self {
        Self::new(
            Category::Warning,
            "Tracking Unavailable",
            "Live tracking is unavailable for this ride right now.",
        )
        .persistent()
    }

    pub fn updates_delayed(failures: u32) -> Self {
        Self::new(
            Category::Warning,
            "Updates Delayed",
            format!("Could not refresh ride status ({failures} failed attempts). Retrying..."),
        )
        .lasting(Duration::from_millis(8000))
    }
}
