use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::models::snapshot::{LiveTrackingResponse, TrackingStatusResponse};
use crate::models::{RideId, TrackingSnapshot};
use crate::session::Credentials;

/// Which pull endpoint a poller hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTier {
    /// Full snapshot: location, status and driver.
    Live,
    /// Lightweight status check.
    StatusOnly,
}

/// Source of authoritative tracking state for a ride.
#[async_trait]
pub trait TrackingSource: Send + Sync + 'static {
    async fn fetch(
        &self,
        ride_id: &RideId,
        tier: PollTier,
        credentials: &Credentials,
    ) -> Result<TrackingSnapshot, FetchError>;
}

pub struct HttpTrackingSource {
    client: Client,
    base_url: Url,
}

impl HttpTrackingSource {
    pub fn new(api_base_url: &str, request_timeout: Duration) -> Result<Self, FetchError> {
        let base_url = Url::parse(api_base_url)
            .map_err(|e| FetchError::Http(format!("invalid base url '{api_base_url}': {e}")))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Http(format!("http client init failed: {e}")))?;
        Ok(Self { client, base_url })
    }

    pub fn endpoint(&self, ride_id: &RideId, tier: PollTier) -> Result<Url, FetchError> {
        let leaf = match tier {
            PollTier::Live => "live",
            PollTier::StatusOnly => "status",
        };
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Http(format!("base url cannot have a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["tracking", "bookings", ride_id.as_str(), leaf]);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        credentials: &Credentials,
    ) -> Result<T, FetchError> {
        debug!("GET {} (token {})", url, credentials.token_preview());

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&credentials.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));
            warn!("Tracking request {} failed: {}", url, message);
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TrackingSource for HttpTrackingSource {
    async fn fetch(
        &self,
        ride_id: &RideId,
        tier: PollTier,
        credentials: &Credentials,
    ) -> Result<TrackingSnapshot, FetchError> {
        let url = self.endpoint(ride_id, tier)?;
        match tier {
            PollTier::Live => {
                let body: LiveTrackingResponse = self.get_json(url, credentials).await?;
                Ok(body.into_snapshot(Utc::now()))
            }
            PollTier::StatusOnly => {
                let body: TrackingStatusResponse = self.get_json(url, credentials).await?;
                Ok(body.into_snapshot(Utc::now()))
            }
        }
    }
}
