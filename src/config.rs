//! Site and tool settings.
//!
//! Per-scan parameters live in the control system under the scan prefix;
//! this file only covers how the tools themselves behave on a given
//! machine: which PV backend to use, fixed pauses, poll intervals and
//! timeouts, and where auxiliary files are found.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub timing: TimingConfig,
    pub timeouts: TimeoutConfig,
    pub paths: PathsConfig,
    pub direct_detector: DirectDetectorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// EPICS command-line tools
    Ca,
    /// In-memory PVs seeded from a JSON snapshot
    Simulated,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub caget: String,
    pub caput: String,
    pub timeout_ms: u64,
    pub snapshot: Option<String>,
}

/// Fixed pauses and poll intervals, in milliseconds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimingConfig {
    pub go_trigger_ms: u64,
    pub settle_poll_ms: u64,
    pub shutter_pause_ms: u64,
    pub shutter_check_ms: u64,
    pub camera_retry_ms: u64,
    pub capture_poll_ms: u64,
    pub template_ms: u64,
    pub grab_pause_ms: u64,
    pub sequence_pause_ms: u64,
    pub writer_toggle_ms: u64,
    pub correction_init_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    /// Upper bound on capture/write completion polling
    pub grab_secs: f64,
    /// Upper bound on waiting for a fresh camera frame
    pub new_image_secs: f64,
    /// Replaces every device's default settle timeout when set
    pub settle_override_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    /// Environment variable naming the shared home directory
    pub home_env: String,
    /// Data-logger PV list directory, relative to the home directory
    pub data_logger_dir: String,
    /// Preferred root for automatically generated data paths
    pub data_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DirectDetectorConfig {
    pub command_pv: String,
    pub status_pv: String,
    pub path_pv: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Ca,
            caget: "caget".to_string(),
            caput: "caput".to_string(),
            timeout_ms: 1000,
            snapshot: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            go_trigger_ms: 200,
            settle_poll_ms: 200,
            shutter_pause_ms: 500,
            shutter_check_ms: 200,
            camera_retry_ms: 1000,
            capture_poll_ms: 50,
            template_ms: 2,
            grab_pause_ms: 500,
            sequence_pause_ms: 250,
            writer_toggle_ms: 250,
            correction_init_ms: 200,
            idle_ms: 1000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grab_secs: 600.0,
            new_image_secs: 120.0,
            settle_override_secs: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            home_env: "NFSHOME".to_string(),
            data_logger_dir: "pvScan/DataLogger".to_string(),
            data_root: "/data/data/".to_string(),
        }
    }
}

impl Default for DirectDetectorConfig {
    fn default() -> Self {
        Self {
            command_pv: "UED:TST:FILEWRITER:CMD".to_string(),
            status_pv: "UED:TST:FILEWRITER:STATUS".to_string(),
            path_pv: "UED:TST:FILEWRITER:PATH".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.timeouts.grab_secs <= 0.0 {
            return Err("timeouts.grab_secs must be positive".to_string());
        }
        if self.timeouts.new_image_secs <= 0.0 {
            return Err("timeouts.new_image_secs must be positive".to_string());
        }
        if let Some(t) = self.timeouts.settle_override_secs {
            if t < 0.0 {
                return Err("timeouts.settle_override_secs must not be negative".to_string());
            }
        }
        if self.timing.settle_poll_ms == 0 || self.timing.capture_poll_ms == 0 {
            return Err("poll intervals must be non-zero".to_string());
        }
        if self.backend.kind == BackendKind::Simulated && self.backend.snapshot.is_none() {
            log::warn!("Simulated backend without snapshot: all PVs start empty");
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["pvscan.toml", "config/pvscan.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Environment overrides, e.g. PVSCAN__TIMEOUTS__GRAB_SECS=30
    builder = builder.add_source(
        Environment::with_prefix("PVSCAN")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?.try_deserialize::<AppConfig>()?;
    config.validate().map_err(ConfigError::Message)?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
