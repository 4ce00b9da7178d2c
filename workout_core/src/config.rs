//! Configuration file support for the workout room.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/workout-room/config.toml`.

use crate::{Error, RecognitionMode, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub recognition: RecognitionConfig,
}

/// Session service endpoints
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_url")]
    pub http_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Retry policy for queued network operations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Batch sealing parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// A batch is sealed once more than this many frames are buffered
    #[serde(default = "default_frame_threshold")]
    pub frame_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            frame_threshold: default_frame_threshold(),
        }
    }
}

/// Session timing parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_blocked_cooldown_ms")]
    pub blocked_cooldown_ms: u64,

    #[serde(default = "default_highlight_ms")]
    pub highlight_ms: u64,

    /// 0 keeps the hint up until the UI dismisses it
    #[serde(default = "default_hint_display_ms")]
    pub hint_display_ms: u64,

    #[serde(default = "default_replace_idle_secs")]
    pub replace_idle_secs: u64,

    /// 0 disables the delayed reveal of the replace affordance
    #[serde(default = "default_replace_reveal_delay_secs")]
    pub replace_reveal_delay_secs: u64,

    #[serde(default = "default_chime_every")]
    pub chime_every: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            blocked_cooldown_ms: default_blocked_cooldown_ms(),
            highlight_ms: default_highlight_ms(),
            hint_display_ms: default_hint_display_ms(),
            replace_idle_secs: default_replace_idle_secs(),
            replace_reveal_delay_secs: default_replace_reveal_delay_secs(),
            chime_every: default_chime_every(),
        }
    }
}

/// Recognition parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub mode: RecognitionMode,

    #[serde(default = "default_fps")]
    pub fps: f32,

    /// pose → key-moment phase, merged over the built-in table
    #[serde(default)]
    pub key_moments: HashMap<String, String>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            mode: RecognitionMode::default(),
            fps: default_fps(),
            key_moments: HashMap::new(),
        }
    }
}

// Default value functions
fn default_http_url() -> String {
    "https://dev.fora.vision".into()
}

fn default_ws_url() -> String {
    "wss://dev.fora.vision".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_ms() -> u64 {
    3000
}

fn default_frame_threshold() -> usize {
    80
}

fn default_blocked_cooldown_ms() -> u64 {
    1000
}

fn default_highlight_ms() -> u64 {
    1000
}

fn default_hint_display_ms() -> u64 {
    3000
}

fn default_replace_idle_secs() -> u64 {
    60
}

fn default_replace_reveal_delay_secs() -> u64 {
    20
}

fn default_chime_every() -> u32 {
    5
}

fn default_fps() -> f32 {
    30.0
}

impl DeliveryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl SessionConfig {
    pub fn blocked_cooldown(&self) -> Duration {
        Duration::from_millis(self.blocked_cooldown_ms)
    }

    pub fn highlight(&self) -> Duration {
        Duration::from_millis(self.highlight_ms)
    }

    pub fn hint_display(&self) -> Option<Duration> {
        (self.hint_display_ms > 0).then(|| Duration::from_millis(self.hint_display_ms))
    }

    pub fn replace_idle(&self) -> Duration {
        Duration::from_secs(self.replace_idle_secs)
    }

    pub fn replace_reveal_delay(&self) -> Option<Duration> {
        (self.replace_reveal_delay_secs > 0)
            .then(|| Duration::from_secs(self.replace_reveal_delay_secs))
    }
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let base = match dirs::config_dir() {
            Some(dir) => dir,
            None => {
                let home = std::env::var("HOME").map_err(|_| {
                    Error::Config("HOME environment variable not set".into())
                })?;
                PathBuf::from(home).join(".config")
            }
        };
        Ok(base.join("workout-room").join("config.toml"))
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values that would stall or spin the session
    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_attempts == 0 {
            return Err(Error::Config("delivery.max_attempts must be at least 1".into()));
        }
        if self.batch.frame_threshold == 0 {
            return Err(Error::Config("batch.frame_threshold must be at least 1".into()));
        }
        if !(self.recognition.fps.is_finite() && self.recognition.fps > 0.0) {
            return Err(Error::Config(format!(
                "recognition.fps must be positive, got {}",
                self.recognition.fps
            )));
        }
        Ok(())
    }
}
