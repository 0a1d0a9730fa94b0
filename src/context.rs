//! Per-invocation scan context.
//!
//! A [`ScanContext`] is built once by each binary from the CLI prefix and the
//! loaded [`AppConfig`], then handed to every component constructor. It owns
//! the PV backend, the status channel, the timing policy and the scan start
//! timestamp used to name output files.

use crate::config::{AppConfig, DirectDetectorConfig, PathsConfig};
use crate::error::ScanError;
use crate::pv::{ProcessVariables, Pv};
use crate::utils::{pause, secs};
use chrono::Local;
use log::warn;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Timestamp flavours used in file names and status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// `YYYYmmdd_HHMMSS`
    Seconds,
    /// `YYYYmmdd_HHMMSS.ffffff`
    Micros,
    /// `YYYYmmdd`
    Date,
}

pub fn timestamp(stamp: Stamp) -> String {
    let now = Local::now();
    match stamp {
        Stamp::Seconds => now.format("%Y%m%d_%H%M%S").to_string(),
        Stamp::Micros => now.format("%Y%m%d_%H%M%S%.6f").to_string(),
        Stamp::Date => now.format("%Y%m%d").to_string(),
    }
}

/// Pauses, poll intervals and wait bounds.
#[derive(Debug, Clone)]
pub struct Timing {
    pub go_trigger: Duration,
    pub settle_poll: Duration,
    pub shutter_pause: Duration,
    pub shutter_check: Duration,
    pub camera_retry: Duration,
    pub capture_poll: Duration,
    pub template: Duration,
    pub grab_pause: Duration,
    pub sequence_pause: Duration,
    pub writer_toggle: Duration,
    pub correction_init: Duration,
    pub idle: Duration,
    pub grab_timeout: Duration,
    pub new_image_timeout: Duration,
    pub settle_override: Option<Duration>,
}

impl Timing {
    pub fn from_config(config: &AppConfig) -> Self {
        let t = &config.timing;
        let ms = Duration::from_millis;
        Self {
            go_trigger: ms(t.go_trigger_ms),
            settle_poll: ms(t.settle_poll_ms),
            shutter_pause: ms(t.shutter_pause_ms),
            shutter_check: ms(t.shutter_check_ms),
            camera_retry: ms(t.camera_retry_ms),
            capture_poll: ms(t.capture_poll_ms),
            template: ms(t.template_ms),
            grab_pause: ms(t.grab_pause_ms),
            sequence_pause: ms(t.sequence_pause_ms),
            writer_toggle: ms(t.writer_toggle_ms),
            correction_init: ms(t.correction_init_ms),
            idle: ms(t.idle_ms),
            grab_timeout: secs(config.timeouts.grab_secs),
            new_image_timeout: secs(config.timeouts.new_image_secs),
            settle_override: config.timeouts.settle_override_secs.map(secs),
        }
    }

    /// No pauses and short bounds, for simulated runs.
    pub fn immediate() -> Self {
        Self {
            go_trigger: Duration::ZERO,
            settle_poll: Duration::from_millis(1),
            shutter_pause: Duration::ZERO,
            shutter_check: Duration::ZERO,
            camera_retry: Duration::ZERO,
            capture_poll: Duration::from_millis(1),
            template: Duration::ZERO,
            grab_pause: Duration::ZERO,
            sequence_pause: Duration::ZERO,
            writer_toggle: Duration::ZERO,
            correction_init: Duration::ZERO,
            idle: Duration::ZERO,
            grab_timeout: Duration::from_millis(20),
            new_image_timeout: Duration::from_millis(20),
            settle_override: Some(Duration::from_millis(20)),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

struct ConsoleInner {
    echo: bool,
    captured: Option<Vec<String>>,
    tee: Option<File>,
}

/// Operator console: stdout, optionally duplicated into the scan `.log` file.
#[derive(Clone)]
pub struct Console {
    inner: Arc<Mutex<ConsoleInner>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Console")
            .field("echo", &inner.echo)
            .field("tee", &inner.tee.is_some())
            .finish()
    }
}

impl Console {
    pub fn stdout() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConsoleInner {
                echo: true,
                captured: None,
                tee: None,
            })),
        }
    }

    /// Console that keeps lines in memory instead of printing them.
    pub fn capture() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConsoleInner {
                echo: false,
                captured: Some(Vec::new()),
                tee: None,
            })),
        }
    }

    /// Start duplicating every line into `path`.
    pub fn tee_to(&self, path: &Path) -> Result<(), ScanError> {
        let file = File::create(path)
            .map_err(|e| ScanError::io(e, format!("creating log file {}", path.display())))?;
        self.inner.lock().tee = Some(file);
        Ok(())
    }

    pub fn write_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        if inner.echo {
            println!("{}", line);
        }
        if let Some(lines) = inner.captured.as_mut() {
            lines.push(line.to_string());
        }
        if let Some(file) = inner.tee.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                warn!("Failed to write log file: {}", e);
            }
        }
    }

    /// Captured lines (empty for a stdout console).
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().captured.clone().unwrap_or_default()
    }
}

/// Status reporting: timestamped console line plus the `<prefix>:MSG` PV.
#[derive(Clone, Debug)]
pub struct StatusChannel {
    msg: Pv,
    severity: Pv,
    console: Console,
}

impl StatusChannel {
    pub fn new(msg: Pv, severity: Pv, console: Console) -> Self {
        Self {
            msg,
            severity,
            console,
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn msg_pv(&self) -> &Pv {
        &self.msg
    }

    pub fn print_msg(&self, message: &str) {
        self.console
            .write_line(&format!("{} {}", timestamp(Stamp::Micros), message));
        if let Err(e) = self.msg.put(message) {
            warn!("Status message put failed: {}", e);
        }
    }

    /// Print a plain line without timestamp or PV update.
    pub fn print_raw(&self, line: &str) {
        self.console.write_line(line);
    }

    /// Announce and perform a pause; zero durations are skipped entirely.
    pub fn print_sleep(&self, duration: Duration, label: &str) {
        if duration.is_zero() {
            return;
        }
        self.print_msg(&format!(
            "{} for {:.6} seconds...",
            label,
            duration.as_secs_f64()
        ));
        pause(duration);
    }

    /// Report a failure: `Failed: ...` with severity 2.
    pub fn fail(&self, message: &str) {
        self.print_msg(&format!("Failed: {}", message));
        if let Err(e) = self.severity.put(2) {
            warn!("Severity put failed: {}", e);
        }
    }
}

/// Everything a component needs to find its configuration and report status.
#[derive(Clone)]
pub struct ScanContext {
    prefix: String,
    backend: Arc<dyn ProcessVariables>,
    status: StatusChannel,
    timing: Timing,
    paths: PathsConfig,
    direct_detector: DirectDetectorConfig,
    started: String,
}

impl ScanContext {
    pub fn new(
        prefix: &str,
        backend: Arc<dyn ProcessVariables>,
        config: &AppConfig,
        console: Console,
    ) -> Self {
        let status = StatusChannel::new(
            Pv::new(backend.clone(), format!("{}:MSG", prefix)),
            Pv::new(backend.clone(), format!("{}:MSG_SEVR", prefix)),
            console,
        );
        Self {
            prefix: prefix.to_string(),
            backend,
            status,
            timing: Timing::from_config(config),
            paths: config.paths.clone(),
            direct_detector: config.direct_detector.clone(),
            started: timestamp(Stamp::Seconds),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> Arc<dyn ProcessVariables> {
        self.backend.clone()
    }

    pub fn status(&self) -> &StatusChannel {
        &self.status
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn direct_detector(&self) -> &DirectDetectorConfig {
        &self.direct_detector
    }

    /// Scan start timestamp, shared by the `.dat` and `.log` file names.
    pub fn started(&self) -> &str {
        &self.started
    }

    /// Absolute PV handle.
    pub fn pv(&self, name: &str) -> Pv {
        Pv::new(self.backend.clone(), name)
    }

    /// Configuration PV under the scan prefix, e.g. `SCAN:MODE`.
    pub fn config_pv(&self, key: &str) -> Pv {
        Pv::new(self.backend.clone(), format!("{}:{}", self.prefix, key))
    }

    pub fn flag(&self, key: &str) -> bool {
        self.config_pv(key).get_bool()
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.config_pv(key).get_f64().unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.config_pv(key).get_i64().unwrap_or(default)
    }

    /// String parameter; empty when unset.
    pub fn string(&self, key: &str) -> String {
        self.config_pv(key)
            .get_string()
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, ScanError> {
        let pv = self.config_pv(key);
        pv.get_f64().ok_or_else(|| {
            ScanError::Config(format!("missing required parameter {}", pv.name()))
        })
    }

    pub fn pid_pv(&self) -> Pv {
        self.config_pv("PID")
    }

    pub fn run_flag_pv(&self) -> Pv {
        self.config_pv("RUNFLAG")
    }

    /// Shared home directory from the configured environment variable.
    pub fn home_dir(&self) -> Option<PathBuf> {
        std::env::var_os(&self.paths.home_env).map(PathBuf::from)
    }
}
