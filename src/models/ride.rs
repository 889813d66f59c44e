use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ride (booking) identifier, stable for the ride's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(String);

impl RideId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RideId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RideId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RideStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Parses the status strings used by the booking backend. Matching is
    /// case-insensitive and tolerant of spaces/underscores ("In Progress",
    /// "in_progress", "inprogress").
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "pending" => Some(Self::Pending),
            "assigned" | "accepted" => Some(Self::Assigned),
            "inprogress" | "started" | "enroute" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::Assigned => "Assigned",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_meters_per_second: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub phone: Option<String>,
}

/// Merged view of one observed ride. Only the tracking store mutates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedRide {
    pub ride_id: RideId,
    pub last_known_location: Option<Location>,
    pub ride_status: RideStatus,
    pub driver_info: Option<DriverInfo>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl TrackedRide {
    pub fn new(ride_id: RideId) -> Self {
        Self {
            ride_id,
            last_known_location: None,
            ride_status: RideStatus::Pending,
            driver_info: None,
            last_event_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_status_spellings() {
        assert_eq!(RideStatus::parse("In Progress"), Some(RideStatus::InProgress));
        assert_eq!(RideStatus::parse("in_progress"), Some(RideStatus::InProgress));
        assert_eq!(RideStatus::parse("ACCEPTED"), Some(RideStatus::Assigned));
        assert_eq!(RideStatus::parse("Canceled"), Some(RideStatus::Cancelled));
        assert_eq!(RideStatus::parse(" pending "), Some(RideStatus::Pending));
        assert_eq!(RideStatus::parse("teleporting"), None);
    }

    #[test]
    fn only_completed_and_cancelled_are_terminal() {
        assert!(RideStatus::Completed.is_terminal());
        assert!(RideStatus::Cancelled.is_terminal());
        assert!(!RideStatus::InProgress.is_terminal());
        assert!(!RideStatus::Pending.is_terminal());
    }
}
