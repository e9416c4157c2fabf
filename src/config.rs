//! Client configuration: backend location, recording, retry and
//! negotiation settings. Loaded from JSON, every field optional.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CallError, SignalingError};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_TIMESLICE: Duration = Duration::from_secs(5);
pub const PREFERRED_MIME_TYPE: &str = "video/webm;codecs=vp8,opus";

/// Which backend surface a session talks to. Practice sessions record alone
/// against a scenario and never open a signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Call,
    Practice,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    #[serde(with = "duration_ms")]
    pub timeslice: Duration,
    pub preferred_mime_type: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            timeslice: DEFAULT_TIMESLICE,
            preferred_mime_type: PREFERRED_MIME_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub session_kind: SessionKind,
    pub participant_id: Option<String>,
    pub recorder: RecorderConfig,
    pub upload_retry: RetryPolicy,
    pub signaling_retry: RetryPolicy,
    #[serde(with = "opt_duration_ms")]
    pub negotiation_timeout: Option<Duration>,
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            session_kind: SessionKind::Call,
            participant_id: None,
            recorder: RecorderConfig::default(),
            upload_retry: RetryPolicy::default(),
            signaling_retry: RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
            },
            negotiation_timeout: Some(Duration::from_secs(30)),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| CallError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn http_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// WebSocket URL of the signaling channel for `session_id`.
    pub fn signaling_url(&self, session_id: &str) -> Result<String, SignalingError> {
        let base = self.http_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(SignalingError::InvalidUrl(self.server_url.clone()));
        };
        Ok(format!("{}/ws/{}", ws_base, session_id))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn signaling_url_swaps_scheme() {
        let mut config = ClientConfig::default();
        config.server_url = "https://calls.example.com/".into();
        assert_eq!(
            config.signaling_url("ab12cd34").unwrap(),
            "wss://calls.example.com/ws/ab12cd34"
        );

        config.server_url = "http://127.0.0.1:8000".into();
        assert_eq!(config.signaling_url("s1").unwrap(), "ws://127.0.0.1:8000/ws/s1");

        config.server_url = "ftp://nope".into();
        assert!(config.signaling_url("s1").is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"server_url":"http://backend:9000","recorder":{"timeslice":2000},"negotiation_timeout":null}"#,
        )
        .unwrap();
        assert_eq!(config.server_url, "http://backend:9000");
        assert_eq!(config.recorder.timeslice, Duration::from_secs(2));
        assert_eq!(config.recorder.preferred_mime_type, PREFERRED_MIME_TYPE);
        assert_eq!(config.negotiation_timeout, None);
        assert_eq!(config.session_kind, SessionKind::Call);
    }

    #[test]
    fn partial_retry_policy_keeps_other_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"upload_retry":{"max_attempts":2}}"#).unwrap();
        assert_eq!(config.upload_retry.max_attempts, 2);
        assert_eq!(config.upload_retry.initial_delay, Duration::from_millis(500));
        assert_eq!(config.upload_retry.max_delay, Duration::from_secs(8));
        assert_eq!(config.signaling_retry, ClientConfig::default().signaling_retry);
    }
}
