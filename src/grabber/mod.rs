//! Image grabbing.
//!
//! Two kinds of camera are supported: areaDetector IOCs
//! ([`AreaDetectorGrabber`]) and the direct detector file writer
//! ([`DirectDetectorGrabber`]). The scan driver only sees the
//! [`ImageGrabber`] trait. A grab is a blocking call, and `&mut self` keeps
//! it to one grab in flight per grabber.

pub mod area_detector;
pub mod direct_detector;
pub mod tiff_tags;

pub use area_detector::{AreaDetectorGrabber, CaptureMode};
pub use direct_detector::DirectDetectorGrabber;

use crate::context::ScanContext;
use crate::error::ScanError;
use crate::pv::Pv;
use crate::utils::secs;
use log::{info, warn};
use std::fmt;
use std::process::Command;
use std::time::Duration;

/// Where a grabber is in its per-grab cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabState {
    Idle,
    Arming,
    Capturing,
    Writing,
    Aborted,
}

impl fmt::Display for GrabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GrabState::Idle => "idle",
            GrabState::Arming => "arming",
            GrabState::Capturing => "capturing",
            GrabState::Writing => "writing",
            GrabState::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// `GRABIMAGES:*` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GrabSettings {
    pub enabled: bool,
    pub count: u32,
    pub second_count: u32,
    pub second_sequence: bool,
    pub second_delay: Duration,
    pub step_number: bool,
    pub wait_new: bool,
    pub stop_acquisition: bool,
    pub tiff_timestamps: bool,
    pub capture_mode: CaptureMode,
    pub data_time: Duration,
}

impl GrabSettings {
    pub fn from_config(ctx: &ScanContext) -> Self {
        let count = |key: &str| ctx.i64_or(key, 0).max(0) as u32;
        Self {
            enabled: ctx.flag("GRABIMAGES:ENABLE"),
            count: count("GRABIMAGES:N"),
            second_count: count("GRABIMAGES:N2"),
            second_sequence: ctx.flag("GRABIMAGES:SEQ2ENABLE"),
            second_delay: secs(ctx.f64_or("GRABIMAGES:SEQ2DELAY", 0.0)),
            step_number: ctx.flag("GRABIMAGES:STEPNUMBER"),
            wait_new: ctx.flag("GRABIMAGES:WAIT_NEW"),
            stop_acquisition: ctx.flag("GRABIMAGES:STOP_ACQ"),
            tiff_timestamps: ctx.flag("GRABIMAGES:TIFFTS"),
            capture_mode: CaptureMode::from_code(ctx.i64_or("GRABIMAGES:CAPTUREMODE", 0)),
            data_time: secs(ctx.f64_or("GRABIMAGES:DATATIME", 0.0)),
        }
    }
}

impl Default for GrabSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 0,
            second_count: 0,
            second_sequence: false,
            second_delay: Duration::ZERO,
            step_number: false,
            wait_new: false,
            stop_acquisition: false,
            tiff_timestamps: false,
            capture_mode: CaptureMode::Individual,
            data_time: Duration::ZERO,
        }
    }
}

pub trait ImageGrabber: Send {
    /// Camera PV prefix.
    fn camera(&self) -> &str;

    fn settings(&self) -> &GrabSettings;

    fn state(&self) -> GrabState;

    /// Per-step file name suffix, e.g. `_delay-003-001.2500`.
    fn filename_extras(&self) -> &str;

    fn set_filename_extras(&mut self, extras: String);

    /// Grab `count` images, or the configured count when `None`. Blocks
    /// until the camera reports the files written.
    fn grab_images(&mut self, count: Option<u32>) -> Result<(), ScanError>;

    /// Block until the camera produces a frame newer than the current one.
    fn wait_for_new_image(&mut self) -> Result<(), ScanError>;

    fn stop_acquire(&mut self) -> Result<(), ScanError>;

    /// Force capture off. Files already written are left in place.
    fn abort(&mut self) -> Result<(), ScanError>;

    /// PVs worth sampling in the data log.
    fn monitor_pvs(&self) -> Vec<Pv>;

    /// Create the image directory when `create` is set and publish its path.
    fn prepare_output(&self, _create: bool) -> Result<(), ScanError> {
        Ok(())
    }
}

/// Build the grabber named by `GRABIMAGES:CAMERA`.
///
/// `filepath` is the experiment directory with a trailing `/`; `expname`
/// is the sample name used by the direct detector's writer path.
pub fn from_config(
    ctx: &ScanContext,
    filepath: &str,
    expname: &str,
) -> Result<Box<dyn ImageGrabber>, ScanError> {
    let camera = ctx.string("GRABIMAGES:CAMERA");
    let settings = GrabSettings::from_config(ctx);
    if camera.contains("DirectD") {
        info!("Using direct detector grabber for {}", camera);
        return Ok(Box::new(DirectDetectorGrabber::new(
            ctx, &camera, expname, settings,
        )));
    }

    let plugin = match ctx.string("GRABIMAGES:PLUGIN") {
        p if p.is_empty() => "TIFF1".to_string(),
        p => p,
    };
    Ok(Box::new(AreaDetectorGrabber::new(
        ctx, &camera, filepath, &plugin, settings,
    )))
}

/// Single-shot trigger command from `GRABIMAGES:SSTRIGGER:*`, if enabled.
pub fn trigger_command(ctx: &ScanContext) -> Option<Vec<String>> {
    if !ctx.flag("GRABIMAGES:SSTRIGGER:ENABLE") {
        return None;
    }
    let argv: Vec<String> = ctx
        .string("GRABIMAGES:SSTRIGGER:PATH")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if argv.is_empty() {
        warn!("Single-shot trigger enabled but GRABIMAGES:SSTRIGGER:PATH is empty");
        return None;
    }
    Some(argv)
}

/// Run a grab on a scoped thread while `trigger` fires the beam.
///
/// The grab must be armed before the shot arrives, so the trigger command
/// runs on the calling thread once the grab thread has started. Both are
/// joined before returning; a grab error wins over a trigger error.
pub fn grab_with_trigger(
    grabber: &mut dyn ImageGrabber,
    count: Option<u32>,
    trigger: &[String],
) -> Result<(), ScanError> {
    let Some((program, args)) = trigger.split_first() else {
        return grabber.grab_images(count);
    };

    std::thread::scope(|scope| {
        let grab = scope.spawn(|| grabber.grab_images(count));

        let triggered = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| ScanError::UserScript(format!("{}: {}", program, e)))
            .and_then(|status| {
                if status.success() {
                    Ok(())
                } else {
                    Err(ScanError::UserScript(format!("{} exited with {}", program, status)))
                }
            });

        let grabbed = grab
            .join()
            .unwrap_or_else(|_| Err(ScanError::Config("grab thread panicked".to_string())));
        grabbed.and(triggered)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sim_context;

    #[test]
    fn test_settings_from_config() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:GRABIMAGES:ENABLE", 1);
        sim.set("TEST:GRABIMAGES:N", 5);
        sim.set("TEST:GRABIMAGES:N2", -3);
        sim.set("TEST:GRABIMAGES:CAPTUREMODE", 1);
        sim.set("TEST:GRABIMAGES:SEQ2DELAY", 1.5);

        let settings = GrabSettings::from_config(&ctx);
        assert!(settings.enabled);
        assert_eq!(settings.count, 5);
        assert_eq!(settings.second_count, 0);
        assert_eq!(settings.capture_mode, CaptureMode::Buffered);
        assert_eq!(settings.second_delay, Duration::from_millis(1500));
        assert!(!settings.stop_acquisition);
    }

    #[test]
    fn test_factory_selects_kind() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:GRABIMAGES:CAMERA", "UED:DirectD");
        let grabber = from_config(&ctx, "/tmp/run/", "sample").unwrap();
        assert_eq!(grabber.camera(), "UED:DirectD");
        assert!(grabber.monitor_pvs().is_empty());

        sim.set("TEST:GRABIMAGES:CAMERA", "ANDOR1");
        let grabber = from_config(&ctx, "/tmp/run/", "sample").unwrap();
        let names: Vec<String> = grabber
            .monitor_pvs()
            .iter()
            .map(|pv| pv.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["ANDOR1:TIFF1:TimeStamp_RBV", "ANDOR1:TIFF1:Capture_RBV.RVAL"]
        );
    }

    #[test]
    fn test_trigger_command_requires_path() {
        let (sim, ctx) = sim_context();
        assert!(trigger_command(&ctx).is_none());
        sim.set("TEST:GRABIMAGES:SSTRIGGER:ENABLE", 1);
        assert!(trigger_command(&ctx).is_none());
        sim.set("TEST:GRABIMAGES:SSTRIGGER:PATH", "singleShot.py TEST beam");
        assert_eq!(
            trigger_command(&ctx).unwrap(),
            vec!["singleShot.py", "TEST", "beam"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_grab_with_trigger_joins_both() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:GRABIMAGES:DATATIME", 0.0);
        let mut grabber = DirectDetectorGrabber::new(&ctx, "UED:DirectD", "sample", GrabSettings::default());
        grab_with_trigger(&mut grabber, None, &["true".to_string()]).unwrap();
        assert_eq!(sim.writes_to("UED:TST:FILEWRITER:CMD").len(), 4);

        let err = grab_with_trigger(&mut grabber, None, &["false".to_string()]);
        assert!(matches!(err, Err(ScanError::UserScript(_))));
    }
}
