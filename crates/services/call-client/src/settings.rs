//! Client settings
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line arguments and environment variables:
//!
//! ```toml
//! api_url = "https://calls.example.org"
//! user_id = "u-42"
//!
//! [call]
//! signaling_url = "wss://calls.example.org"
//! stun_servers = ["stun:stun.l.google.com:19302"]
//!
//! [call.media]
//! video = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vcme_core::CallConfig;

/// Directory API used when neither the file nor the command line names one
pub const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing setting: {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Invalid(#[from] vcme_core::Error),
}

/// Settings as read from a file, all optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the call directory REST API
    pub api_url: Option<String>,

    /// Participant id of the local user
    pub user_id: Option<String>,

    /// Orchestrator configuration
    pub call: CallConfig,
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub signaling_url: Option<String>,
    pub api_url: Option<String>,
    pub user_id: Option<String>,
    pub stun_servers: Option<Vec<String>>,
    pub audio_only: bool,
}

/// Complete, validated settings
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub api_url: String,
    pub user_id: String,
    pub call: CallConfig,
}

impl ClientSettings {
    /// Read settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse settings from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides and validate
    pub fn resolve(mut self, overrides: Overrides) -> Result<ResolvedSettings, SettingsError> {
        if let Some(url) = overrides.signaling_url {
            self.call.signaling_url = url;
        }
        if let Some(servers) = overrides.stun_servers {
            self.call.stun_servers = servers;
        }
        if overrides.audio_only {
            self.call.media.video = false;
        }

        let api_url = overrides
            .api_url
            .or(self.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let user_id = overrides
            .user_id
            .or(self.user_id)
            .ok_or(SettingsError::Missing("user_id"))?;

        self.call.validate()?;

        Ok(ResolvedSettings {
            api_url,
            user_id,
            call: self.call,
        })
    }
}
