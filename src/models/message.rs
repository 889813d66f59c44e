use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Envelope of every frame on the tracking socket.
#[derive(Debug, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct LocationData {
    #[serde(alias = "lat", default, deserialize_with = "parse_f64_option")]
    pub latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon", default, deserialize_with = "parse_f64_option")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub speed: Option<f64>,
    #[serde(alias = "course", default, deserialize_with = "parse_f64_option")]
    pub heading: Option<f64>,
    #[serde(
        alias = "observedAt",
        alias = "timestamp",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(alias = "ride_id", default, deserialize_with = "parse_id_option")]
    pub booking_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusData {
    #[serde(alias = "status")]
    pub ride_status: Option<String>,
    pub booking_status: Option<String>,
    #[serde(
        alias = "timestamp",
        alias = "updated_at",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub at: Option<DateTime<Utc>>,
    #[serde(alias = "ride_id", default, deserialize_with = "parse_id_option")]
    pub booking_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DriverData {
    #[serde(alias = "driver_name")]
    pub name: Option<String>,
    #[serde(alias = "driver_phone")]
    pub phone: Option<String>,
    #[serde(
        alias = "timestamp",
        alias = "assigned_at",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub at: Option<DateTime<Utc>>,
    #[serde(alias = "ride_id", default, deserialize_with = "parse_id_option")]
    pub booking_id: Option<String>,
}

/// Payload of `ride_started` / `ride_completed`, which carry no state of their own.
#[derive(Debug, Default, Deserialize)]
pub struct MarkerData {
    #[serde(
        alias = "timestamp",
        alias = "started_at",
        alias = "completed_at",
        default,
        deserialize_with = "parse_timestamp_option"
    )]
    pub at: Option<DateTime<Utc>>,
    #[serde(alias = "ride_id", default, deserialize_with = "parse_id_option")]
    pub booking_id: Option<String>,
}

pub(crate) fn parse_f64_option<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrFloat {
        String(String),
        Float(f64),
    }

    let v: Option<StringOrFloat> = Option::deserialize(deserializer)?;
    match v {
        Some(StringOrFloat::Float(f)) => Ok(Some(f)),
        Some(StringOrFloat::String(s)) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                s.trim().parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}

/// Accepts RFC 3339 strings, `YYYY-MM-DD HH:MM:SS` (taken as UTC) or epoch milliseconds.
pub(crate) fn parse_timestamp_option<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrMillis {
        Millis(i64),
        String(String),
    }

    let v: Option<StringOrMillis> = Option::deserialize(deserializer)?;
    match v {
        Some(StringOrMillis::Millis(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        Some(StringOrMillis::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(t.with_timezone(&Utc)));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map(|t| Some(t.and_utc()))
                .map_err(|_| serde::de::Error::custom(format!("invalid timestamp: '{s}'")))
        }
        None => Ok(None),
    }
}

pub(crate) fn parse_id_option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Value> = Option::deserialize(deserializer)?;
    match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Null) | None => Ok(None),
        Some(Value::String(_)) => Ok(None),
        Some(other) => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}
