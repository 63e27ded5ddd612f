//! Konfiguration
//!
//! Lädt `config.json` aus dem App-Konfigurationsverzeichnis (falls
//! vorhanden) und überschreibt einzelne Werte aus Umgebungsvariablen.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default Signaling URL
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine app config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Laufzeit-Konfiguration des Call-Cores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// HTTP(S)-Basis-URL des Relays; die WebSocket-URL wird daraus abgeleitet
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Klingelt ein Anruf länger, wird er beendet. `None` = kein Timeout
    pub ring_timeout_ms: Option<u64>,
    /// Wartezeit nach Verbindungsverlust zum Relay, bevor die Session endet
    pub relay_grace_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            // Google STUN Server (kostenlos, für ~90% der Verbindungen)
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            ring_timeout_ms: None,
            relay_grace_ms: 0,
            heartbeat_interval_secs: 25,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus dem Standardpfad und der Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "kaufm", "call-app")
            .ok_or(ConfigError::NoConfigDir)?;

        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push("config.json");
        Ok(path)
    }

    /// Überschreibt Werte aus Umgebungsvariablen
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(value) = lookup("PULSE_RING_TIMEOUT_MS") {
            let ms = parse_ms("PULSE_RING_TIMEOUT_MS", &value)?;
            // 0 schaltet den Timeout ab
            self.ring_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(value) = lookup("PULSE_RELAY_GRACE_MS") {
            self.relay_grace_ms = parse_ms("PULSE_RELAY_GRACE_MS", &value)?;
        }
        Ok(())
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_ms.map(Duration::from_millis)
    }

    pub fn relay_grace(&self) -> Duration {
        Duration::from_millis(self.relay_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

fn parse_ms(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}
