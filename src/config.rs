//! Configuration management for wiimoted
//!
//! Handles loading, validation and saving of the JSON configuration file.
//! Configuration is stored at `~/.config/wiimoted/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "wiimoted";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

/// Upper bound for the signature read retry cap
const MAX_EXTENSION_ATTEMPTS: u32 = 10;

/// Upper bound for any single delay, in milliseconds
const MAX_DELAY_MS: u64 = 10_000;

// ============================================================================
// Timing Configuration
// ============================================================================

/// Device pacing delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause after each control register write (default: 100)
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Length of the rumble pulse sent on connect (default: 250)
    #[serde(default = "default_rumble_pulse")]
    pub rumble_pulse_ms: u64,

    /// How long one extension signature read waits for its response (default: 1000)
    #[serde(default = "default_signature_timeout")]
    pub signature_timeout_ms: u64,

    /// Idle sleep while waiting for a response (default: 1)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_settle_delay() -> u64 { 100 }
fn default_rumble_pulse() -> u64 { 250 }
fn default_signature_timeout() -> u64 { 1000 }
fn default_poll_interval() -> u64 { 1 }

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            rumble_pulse_ms: 250,
            signature_timeout_ms: 1000,
            poll_interval_ms: 1,
        }
    }
}

impl TimingConfig {
    /// Clamp delays to a sane range
    pub fn validate(&mut self) {
        self.settle_delay_ms = self.settle_delay_ms.min(MAX_DELAY_MS);
        self.rumble_pulse_ms = self.rumble_pulse_ms.min(MAX_DELAY_MS);
        self.signature_timeout_ms = self.signature_timeout_ms.clamp(1, MAX_DELAY_MS);
        self.poll_interval_ms = self.poll_interval_ms.min(1000);
    }
}

// ============================================================================
// Extension Configuration
// ============================================================================

/// Extension detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Run extension detection during initialization
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Signature reads before giving up (1-10, default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_true() -> bool { true }
fn default_max_attempts() -> u32 { 3 }

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
        }
    }
}

impl ExtensionConfig {
    pub fn validate(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, MAX_EXTENSION_ATTEMPTS);
    }
}

// ============================================================================
// Event Feed Configuration
// ============================================================================

/// What the poll feed surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Emit accelerometer samples
    #[serde(default = "default_true")]
    pub emit_accel: bool,

    /// Attach g values to accelerometer samples when calibration is valid
    #[serde(default = "default_true")]
    pub apply_calibration: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            emit_accel: true,
            apply_calibration: true,
        }
    }
}

/// Player LED assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedConfig {
    /// Light LED n for player n (otherwise LED 1 for every device)
    #[serde(default = "default_true")]
    pub player_leds: bool,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self { player_leds: true }
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub extension: ExtensionConfig,

    #[serde(default)]
    pub events: EventConfig,

    #[serde(default)]
    pub leds: LedConfig,

    /// Configuration file path (not serialized)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Get the default config directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from file path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        let mut config: Config =
            serde_json::from_str(&contents).map_err(ConfigError::ParseError)?;

        config.validate();
        config.config_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            settle_delay_ms = config.timing.settle_delay_ms,
            extension_enabled = config.extension.enabled,
            max_attempts = config.extension.max_attempts,
            emit_accel = config.events.emit_accel,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate and clamp all values
    pub fn validate(&mut self) {
        self.timing.validate();
        self.extension.validate();
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => Self::default_config_path()
                .ok_or_else(|| ConfigError::ValidationError("No config path".to_string()))?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::ParseError)?;
        fs::write(&path, contents).map_err(ConfigError::IoError)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing file
    IoError(std::io::Error),
    /// JSON parsing error
    ParseError(serde_json::Error),
    /// Validation error
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(e) => Some(e),
            ConfigError::ValidationError(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
