use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::channel::ChannelSettings;
use crate::connection::ReconnectPolicy;
use crate::models::RideId;
use crate::poller::PollSettings;
use crate::session::Credentials;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    pub user_role: String,
    pub ride_id: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
    /// Seconds between full snapshot polls, 0 disables.
    pub live_poll_interval_secs: u64,
    /// Seconds between status-only polls, 0 disables.
    pub status_poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub fetch_failure_threshold: u32,
    pub terminal_grace_secs: u64,
    pub log_level: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_base_url = text("API_BASE_URL", "http://localhost:8080");
        reqwest::Url::parse(&api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid url: {api_base_url}"))?;

        Ok(Self {
            api_base_url,
            auth_token: optional("AUTH_TOKEN"),
            user_id: optional("USER_ID"),
            user_role: text("USER_ROLE", "rider"),
            ride_id: optional("RIDE_ID"),
            reconnect_base_delay_ms: number(&lookup, "RECONNECT_BASE_DELAY_MS", 3000),
            reconnect_max_delay_ms: number(&lookup, "RECONNECT_MAX_DELAY_MS", 30_000),
            max_reconnect_attempts: number(&lookup, "MAX_RECONNECT_ATTEMPTS", 5),
            connect_timeout_ms: number(&lookup, "CONNECT_TIMEOUT_MS", 10_000),
            live_poll_interval_secs: number(&lookup, "LIVE_POLL_INTERVAL_SECS", 15),
            status_poll_interval_secs: number(&lookup, "STATUS_POLL_INTERVAL_SECS", 30),
            request_timeout_secs: number(&lookup, "REQUEST_TIMEOUT_SECS", 30),
            fetch_failure_threshold: number(&lookup, "FETCH_FAILURE_THRESHOLD", 3),
            terminal_grace_secs: number(&lookup, "TERMINAL_GRACE_SECS", 30),
            log_level: text("LOG_LEVEL", "info"),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        let interval = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        PollSettings {
            live_interval: interval(self.live_poll_interval_secs),
            status_interval: interval(self.status_poll_interval_secs),
            failure_threshold: self.fetch_failure_threshold.max(1),
        }
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            reconnect: self.reconnect_policy(),
            polling: self.poll_settings(),
            terminal_grace: self.terminal_grace(),
        }
    }

    /// `None` unless both a user id and a token are configured.
    pub fn credentials(&self) -> Option<Credentials> {
        let user_id = self.user_id.as_ref()?;
        let token = self.auth_token.as_ref()?;
        Some(Credentials::new(user_id.as_str(), self.user_role.as_str(), token.as_str()))
            .filter(Credentials::is_complete)
    }

    pub fn ride_id(&self) -> Option<RideId> {
        self.ride_id.as_deref().map(RideId::from)
    }
}

fn number<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();

        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::default());
        assert_eq!(config.poll_settings(), PollSettings::default());
        assert_eq!(config.terminal_grace(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert!(config.credentials().is_none());
        assert!(config.ride_id().is_none());
    }

    #[test]
    fn zero_interval_disables_a_poll_tier() {
        let config = config(&[
            ("LIVE_POLL_INTERVAL_SECS", "0"),
            ("STATUS_POLL_INTERVAL_SECS", "45"),
        ])
        .unwrap();
        let polling = config.poll_settings();

        assert_eq!(polling.live_interval, None);
        assert_eq!(polling.status_interval, Some(Duration::from_secs(45)));
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let config = config(&[("MAX_RECONNECT_ATTEMPTS", "lots"), ("CONNECT_TIMEOUT_MS", " 2500 ")])
            .unwrap();

        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.connect_timeout_ms, 2500);
    }

    #[test]
    fn credentials_need_user_and_token() {
        let partial = config(&[("USER_ID", "u1")]).unwrap();
        assert!(partial.credentials().is_none());

        let full = config(&[("USER_ID", "u1"), ("AUTH_TOKEN", "secret"), ("USER_ROLE", "driver")])
            .unwrap();
        let credentials = full.credentials().unwrap();
        assert_eq!(credentials.user_id, "u1");
        assert_eq!(credentials.role, "driver");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(config(&[("API_BASE_URL", "::nope")]).is_err());
    }
}
