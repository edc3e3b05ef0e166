//! Configuration types for the call orchestrator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a call client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// Path of the signaling endpoint on the server (default: `/ws/`)
    pub ws_path: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Which local tracks to capture
    pub media: MediaConstraints,

    /// Upper bound on how long a send waits for the channel to open
    /// (0 = wait until the connection attempt resolves)
    pub send_timeout_secs: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Local capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Capture a microphone track
    pub audio: bool,

    /// Capture a camera track
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:5000".to_string(),
            ws_path: "/ws/".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            media: MediaConstraints::default(),
            send_timeout_secs: 30,
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a ws:// or wss:// URL
    /// - `stun_servers` is empty
    /// - a TURN server URL does not start with turn: or turns:
    /// - both audio and video capture are disabled
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        url::Url::parse(&self.signaling_url).map_err(|e| {
            Error::InvalidConfig(format!("signaling_url is not a valid URL: {}", e))
        })?;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if let Some(turn) = self
            .turn_servers
            .iter()
            .find(|t| !t.url.starts_with("turn:") && !t.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server URL must start with turn: or turns:, got {}",
                turn.url
            )));
        }

        if !self.media.audio && !self.media.video {
            return Err(Error::InvalidConfig(
                "At least one of audio or video capture must be enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the signaling endpoint URL carrying the bearer credential
    pub fn signaling_endpoint(&self, token: &str) -> crate::Result<url::Url> {
        let base = url::Url::parse(&self.signaling_url).map_err(|e| {
            crate::Error::InvalidConfig(format!("signaling_url is not a valid URL: {}", e))
        })?;
        let mut endpoint = base.join(&self.ws_path).map_err(|e| {
            crate::Error::InvalidConfig(format!("ws_path {} is not valid: {}", self.ws_path, e))
        })?;
        endpoint.query_pairs_mut().append_pair("token", token);
        Ok(endpoint)
    }

    /// Bounded wait for the channel-open transition, if any
    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_secs > 0).then(|| Duration::from_secs(self.send_timeout_secs))
    }
}
