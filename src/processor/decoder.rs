use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DecodeError;
use crate::models::message::{DriverData, LocationData, MarkerData, PushMessage, StatusData};
use crate::models::{DriverInfo, Location, RideId, RideStatus};

/// Closed set of events the tracking socket can deliver for a ride.
#[derive(Debug, Clone, PartialEq)]
pub enum RideEvent {
    LocationUpdate(Location),
    StatusChange { status: RideStatus, at: DateTime<Utc> },
    DriverAssigned { driver: DriverInfo, at: DateTime<Utc> },
    RideStarted { at: DateTime<Utc> },
    RideCompleted { at: DateTime<Utc> },
}

impl RideEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocationUpdate(_) => "location_update",
            Self::StatusChange { .. } => "ride_status_update",
            Self::DriverAssigned { .. } => "driver_assigned",
            Self::RideStarted { .. } => "ride_started",
            Self::RideCompleted { .. } => "ride_completed",
        }
    }
}

/// Decodes a raw socket frame. Missing timestamps fall back to `received_at`.
pub fn decode(
    payload: &[u8],
    ride_id: &RideId,
    received_at: DateTime<Utc>,
) -> Result<RideEvent, DecodeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    decode_value(value, ride_id, received_at)
}

/// Decodes an already-parsed frame.
pub fn decode_value(
    value: Value,
    ride_id: &RideId,
    received_at: DateTime<Utc>,
) -> Result<RideEvent, DecodeError> {
    let message: PushMessage =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    match message.kind.as_str() {
        "location_update" => {
            let data: LocationData = data_as(message.data)?;
            ensure_same_ride(data.booking_id.as_deref(), ride_id)?;
            let (latitude, longitude) = match (data.latitude, data.longitude) {
                (Some(lat), Some(lng)) => (lat, lng),
                _ => {
                    return Err(DecodeError::Malformed(
                        "location_update without coordinates".to_string(),
                    ))
                }
            };
            if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                return Err(DecodeError::Malformed(format!(
                    "coordinates out of range: {latitude}, {longitude}"
                )));
            }
            Ok(RideEvent::LocationUpdate(Location {
                latitude,
                longitude,
                speed_meters_per_second: data.speed,
                heading_degrees: data.heading,
                observed_at: data.observed_at.unwrap_or(received_at),
            }))
        }
        "ride_status_update" | "ride_status_change" => {
            let data: StatusData = data_as(message.data)?;
            ensure_same_ride(data.booking_id.as_deref(), ride_id)?;
            let raw = data
                .ride_status
                .ok_or_else(|| DecodeError::Malformed("status event without ride_status".to_string()))?;
            let status = RideStatus::parse(&raw)
                .ok_or_else(|| DecodeError::Malformed(format!("unknown ride status '{raw}'")))?;
            Ok(RideEvent::StatusChange {
                status,
                at: data.at.unwrap_or(received_at),
            })
        }
        "driver_assigned" => {
            let data: DriverData = data_as(message.data)?;
            ensure_same_ride(data.booking_id.as_deref(), ride_id)?;
            let name = data
                .name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| DecodeError::Malformed("driver_assigned without name".to_string()))?;
            Ok(RideEvent::DriverAssigned {
                driver: DriverInfo {
                    name,
                    phone: data.phone,
                },
                at: data.at.unwrap_or(received_at),
            })
        }
        "ride_started" => {
            let data: MarkerData = data_or_default(message.data)?;
            ensure_same_ride(data.booking_id.as_deref(), ride_id)?;
            Ok(RideEvent::RideStarted {
                at: data.at.unwrap_or(received_at),
            })
        }
        "ride_completed" => {
            let data: MarkerData = data_or_default(message.data)?;
            ensure_same_ride(data.booking_id.as_deref(), ride_id)?;
            Ok(RideEvent::RideCompleted {
                at: data.at.unwrap_or(received_at),
            })
        }
        other => Err(DecodeError::UnknownEventType(other.to_string())),
    }
}

fn data_as<T: DeserializeOwned>(data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn data_or_default<T: DeserializeOwned + Default>(data: Value) -> Result<T, DecodeError> {
    if data.is_null() {
        return Ok(T::default());
    }
    data_as(data)
}

fn ensure_same_ride(claimed: Option<&str>, ride_id: &RideId) -> Result<(), DecodeError> {
    match claimed {
        Some(other) if other != ride_id.as_str() => Err(DecodeError::ForeignRide(other.to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap()
    }

    fn ride() -> RideId {
        RideId::new("R1")
    }

    #[test]
    fn decodes_location_update() {
        let payload = br#"{"type":"location_update","data":{"latitude":1,"longitude":2,"speed":"8.5","heading":180,"timestamp":"2025-03-01T09:29:58Z","booking_id":"R1"}}"#;

        let event = decode(payload, &ride(), received_at()).unwrap();

        assert_eq!(
            event,
            RideEvent::LocationUpdate(Location {
                latitude: 1.0,
                longitude: 2.0,
                speed_meters_per_second: Some(8.5),
                heading_degrees: Some(180.0),
                observed_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 29, 58).unwrap(),
            })
        );
    }

    #[test]
    fn location_without_timestamp_is_stamped_at_receipt() {
        let payload = br#"{"type":"location_update","data":{"lat":1,"lng":2}}"#;

        match decode(payload, &ride(), received_at()).unwrap() {
            RideEvent::LocationUpdate(location) => assert_eq!(location.observed_at, received_at()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn both_status_type_spellings_are_recognized() {
        for kind in ["ride_status_update", "ride_status_change"] {
            let payload = format!(r#"{{"type":"{kind}","data":{{"ride_status":"In Progress"}}}}"#);
            let event = decode(payload.as_bytes(), &ride(), received_at()).unwrap();
            assert_eq!(
                event,
                RideEvent::StatusChange {
                    status: RideStatus::InProgress,
                    at: received_at()
                }
            );
        }
    }

    #[test]
    fn decodes_driver_and_marker_events() {
        let driver = decode(
            br#"{"type":"driver_assigned","data":{"name":"Sam","phone":"555-0100"}}"#,
            &ride(),
            received_at(),
        )
        .unwrap();
        assert_eq!(
            driver,
            RideEvent::DriverAssigned {
                driver: DriverInfo {
                    name: "Sam".to_string(),
                    phone: Some("555-0100".to_string())
                },
                at: received_at()
            }
        );

        let started = decode(br#"{"type":"ride_started"}"#, &ride(), received_at()).unwrap();
        assert_eq!(started, RideEvent::RideStarted { at: received_at() });

        let completed = decode(
            br#"{"type":"ride_completed","data":{"completed_at":1740821400000}}"#,
            &ride(),
            received_at(),
        )
        .unwrap();
        assert_eq!(
            completed,
            RideEvent::RideCompleted {
                at: Utc.timestamp_millis_opt(1740821400000).unwrap()
            }
        );
    }

    #[test]
    fn decodes_structured_payloads() {
        let value = serde_json::json!({ "type": "ride_status_change", "data": { "status": "cancelled" } });
        let event = decode_value(value, &ride(), received_at()).unwrap();
        assert!(matches!(
            event,
            RideEvent::StatusChange {
                status: RideStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn unknown_type_is_reported_not_fatal() {
        let err = decode(br#"{"type":"surge_pricing","data":{}}"#, &ride(), received_at()).unwrap_err();
        assert_eq!(err, DecodeError::UnknownEventType("surge_pricing".to_string()));
    }

    #[test]
    fn malformed_payloads_are_reported() {
        let payloads: [&[u8]; 7] = [
            b"not json",
            br#"{"data":{}}"#,
            br#"{"type":"location_update","data":{"lat":"north","lng":2}}"#,
            br#"{"type":"location_update","data":{"lat":1}}"#,
            br#"{"type":"location_update","data":{"lat":91,"lng":2}}"#,
            br#"{"type":"ride_status_update","data":{"ride_status":"teleporting"}}"#,
            br#"{"type":"driver_assigned","data":{"phone":"555"}}"#,
        ];
        for payload in payloads {
            let err = decode(payload, &ride(), received_at()).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed(_)), "{err:?}");
        }
    }

    #[test]
    fn events_for_other_rides_are_rejected() {
        let err = decode(
            br#"{"type":"ride_started","data":{"booking_id":"R2"}}"#,
            &ride(),
            received_at(),
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::ForeignRide("R2".to_string()));
    }
}
