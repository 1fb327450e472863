//! Peer and rendezvous configuration
//!
//! Settings are stored as JSON and fall back to defaults when the file is
//! missing or empty. Two environment variables override the file:
//! `PEERCHAT_CONFIG` picks the settings path and `PEERCHAT_DIRECTORY_URL`
//! replaces the directory base URL.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default settings file used when `PEERCHAT_CONFIG` is not set
pub const DEFAULT_SETTINGS_PATH: &str = "peerchat.json";

/// Environment variable naming the settings file
pub const CONFIG_PATH_ENV: &str = "PEERCHAT_CONFIG";

/// Environment variable overriding [`Settings::directory_url`]
pub const DIRECTORY_URL_ENV: &str = "PEERCHAT_DIRECTORY_URL";

/// Peer settings
///
/// # Example
/// ```rust,no_run
/// use peerchat::config::Settings;
///
/// let settings = Settings::load("peerchat.json").expect("Failed to load");
/// println!("Directory: {}", settings.directory_url);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the rendezvous directory
    pub directory_url: String,
    /// Timeout applied to every directory request, in seconds
    pub request_timeout_secs: u64,
    /// Timeout for dialing a peer, in seconds
    pub connect_timeout_secs: u64,
    /// Host the inbound listener binds to
    pub listen_host: String,
    /// Address advertised when registering; detected from the routing table
    /// when unset
    pub advertise_ip: Option<String>,
    /// Longest accepted chat frame in bytes, excluding the newline
    pub max_frame_bytes: usize,
    /// Opening a chat deactivates every other chat
    pub exclusive_active_chat: bool,
}

impl Settings {
    /// Load settings from a JSON file
    ///
    /// Returns the defaults if the file does not exist or is empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read settings: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;

        Ok(settings)
    }

    /// Load settings from `PEERCHAT_CONFIG` (or the default path) and apply
    /// environment overrides
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
        let mut settings = Self::load(&path)?;

        if let Ok(url) = std::env::var(DIRECTORY_URL_ENV) {
            settings.directory_url = url;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a JSON file, creating parent directories as needed
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create settings directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Check that the values are usable
    pub fn validate(&self) -> Result<()> {
        if !(self.directory_url.starts_with("http://") || self.directory_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "directory_url must be an http(s) URL, got {:?}",
                self.directory_url
            )));
        }
        if self.request_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be at least one second".to_string()));
        }
        if let Some(ip) = &self.advertise_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(Error::Config(format!("advertise_ip is not an IP address: {:?}", ip)));
            }
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config("max_frame_bytes must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Directory request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Peer dial timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 3,
            connect_timeout_secs: 3,
            listen_host: "0.0.0.0".to_string(),
            advertise_ip: None,
            max_frame_bytes: 1024,
            exclusive_active_chat: true,
        }
    }
}

/// Rendezvous service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSettings {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// SQLite database file
    pub database_path: String,
}

impl RendezvousSettings {
    /// Load rendezvous settings from a JSON file, defaulting when absent
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read rendezvous settings: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse rendezvous settings: {}", e)))
    }
}

impl Default for RendezvousSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_path: "rendezvous.db".to_string(),
        }
    }
}
