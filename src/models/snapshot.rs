use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::message::{parse_f64_option, parse_timestamp_option};
use super::ride::{DriverInfo, Location, RideStatus};

/// Body of `GET /tracking/bookings/{id}/live`.
#[derive(Debug, Default, Deserialize)]
pub struct LiveTrackingResponse {
    #[serde(default)]
    pub tracking_active: bool,
    pub current_location: Option<SnapshotLocation>,
    pub status: Option<SnapshotStatus>,
    pub driver_info: Option<SnapshotDriver>,
}

/// Body of `GET /tracking/bookings/{id}/status`.
#[derive(Debug, Default, Deserialize)]
pub struct TrackingStatusResponse {
    #[serde(default)]
    pub tracking_active: bool,
    pub ride_status: Option<String>,
    pub booking_status: Option<String>,
    #[serde(
        alias = "timestamp",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotLocation {
    #[serde(alias = "lat", default, deserialize_with = "parse_f64_option")]
    pub latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon", default, deserialize_with = "parse_f64_option")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub heading: Option<f64>,
    #[serde(
        alias = "observed_at",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotStatus {
    pub ride_status: Option<String>,
    pub booking_status: Option<String>,
    #[serde(
        alias = "timestamp",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotDriver {
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Authoritative state for one ride as reported by the pull endpoint, with
/// every timestamp resolved (missing ones are stamped at receipt).
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSnapshot {
    pub tracking_active: bool,
    pub location: Option<Location>,
    pub status: Option<(RideStatus, DateTime<Utc>)>,
    pub driver: Option<DriverInfo>,
    pub received_at: DateTime<Utc>,
}

impl TrackingSnapshot {
    /// Latest server-side time in the snapshot (status or location), falling
    /// back to receipt time when it carries neither.
    pub fn server_time(&self) -> DateTime<Utc> {
        let status_at = self.status.map(|(_, at)| at);
        let located_at = self.location.as_ref().map(|l| l.observed_at);
        status_at.max(located_at).unwrap_or(self.received_at)
    }
}

impl LiveTrackingResponse {
    pub fn into_snapshot(self, received_at: DateTime<Utc>) -> TrackingSnapshot {
        let location = self.current_location.and_then(|loc| {
            Some(Location {
                latitude: loc.latitude?,
                longitude: loc.longitude?,
                speed_meters_per_second: loc.speed,
                heading_degrees: loc.heading,
                observed_at: loc.timestamp.unwrap_or(received_at),
            })
        });

        let status = self.status.and_then(|s| {
            let status = s.ride_status.as_deref().and_then(RideStatus::parse)?;
            Some((status, s.updated_at.unwrap_or(received_at)))
        });

        let driver = self.driver_info.and_then(|d| {
            Some(DriverInfo {
                name: d.name.filter(|n| !n.trim().is_empty())?,
                phone: d.phone,
            })
        });

        TrackingSnapshot {
            tracking_active: self.tracking_active,
            location,
            status,
            driver,
            received_at,
        }
    }
}

impl TrackingStatusResponse {
    pub fn into_snapshot(self, received_at: DateTime<Utc>) -> TrackingSnapshot {
        let status = self
            .ride_status
            .as_deref()
            .and_then(RideStatus::parse)
            .map(|status| (status, self.updated_at.unwrap_or(received_at)));

        TrackingSnapshot {
            tracking_active: self.tracking_active,
            location: None,
            status,
            driver: None,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn live_response_without_timestamps_is_stamped_at_receipt() {
        let body = r#"
        {
            "tracking_active": true,
            "current_location": { "latitude": 40.7, "longitude": -74.0, "speed": 22 },
            "status": { "ride_status": "In Progress", "booking_status": "Confirmed" },
            "driver_info": { "name": "Sam", "phone": "555-0100" }
        }
        "#;
        let received_at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        let snapshot = serde_json::from_str::<LiveTrackingResponse>(body)
            .unwrap()
            .into_snapshot(received_at);

        assert!(snapshot.tracking_active);
        let location = snapshot.location.unwrap();
        assert_eq!(location.observed_at, received_at);
        assert_eq!(location.speed_meters_per_second, Some(22.0));
        assert_eq!(snapshot.status, Some((RideStatus::InProgress, received_at)));
        assert_eq!(snapshot.driver.unwrap().name, "Sam");
    }

    #[test]
    fn inactive_tracking_without_location_yields_empty_snapshot() {
        let received_at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let snapshot = serde_json::from_str::<LiveTrackingResponse>(r#"{"tracking_active": false}"#)
            .unwrap()
            .into_snapshot(received_at);

        assert!(!snapshot.tracking_active);
        assert!(snapshot.location.is_none());
        assert!(snapshot.status.is_none());
        assert!(snapshot.driver.is_none());
    }

    #[test]
    fn status_response_keeps_server_timestamp() {
        let body = r#"{ "tracking_active": true, "ride_status": "completed", "updated_at": "2025-01-01T11:59:00Z" }"#;
        let received_at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        let snapshot = serde_json::from_str::<TrackingStatusResponse>(body)
            .unwrap()
            .into_snapshot(received_at);

        assert_eq!(
            snapshot.status,
            Some((
                RideStatus::Completed,
                Utc.with_ymd_and_hms(2025, 1, 1, 11, 59, 0).unwrap()
            ))
        );
    }

    #[test]
    fn server_time_prefers_server_stamps_over_receipt() {
        let body = r#"
        {
            "tracking_active": true,
            "status": { "ride_status": "completed", "updated_at": "2025-01-01T11:58:00Z" },
            "driver_info": { "name": "Sam" }
        }
        "#;
        let received_at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let snapshot = serde_json::from_str::<LiveTrackingResponse>(body)
            .unwrap()
            .into_snapshot(received_at);

        assert_eq!(
            snapshot.server_time(),
            Utc.with_ymd_and_hms(2025, 1, 1, 11, 58, 0).unwrap()
        );

        let empty = serde_json::from_str::<LiveTrackingResponse>(r#"{"tracking_active": true}"#)
            .unwrap()
            .into_snapshot(received_at);
        assert_eq!(empty.server_time(), received_at);
    }
}
