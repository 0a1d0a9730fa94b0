//! One scan invocation: output directory, hardware and logging built from
//! the configuration namespace, then the sweep itself.

use crate::context::ScanContext;
use crate::correction::ScanCorrection;
use crate::data_logger::DataLogger;
use crate::device::ScanDevice;
use crate::error::ScanError;
use crate::grabber::{self, ImageGrabber};
use crate::pv::Pv;
use crate::scan::{ScanComponents, ScanDriver, ScanMode, ScanOptions};
use crate::shutter::Shutter;
use crate::utils::pause;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub const DEVICE_SLOTS: usize = 2;
pub const SHUTTER_SLOTS: usize = 3;

/// Which outputs this scan produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFlags {
    pub data: bool,
    pub log: bool,
    pub images: bool,
}

impl OutputFlags {
    pub fn from_config(ctx: &ScanContext) -> Self {
        Self {
            data: ctx.flag("DATA:ENABLE"),
            log: ctx.flag("LOG:ENABLE"),
            images: ctx.flag("GRABIMAGES:ENABLE"),
        }
    }

    pub fn any(&self) -> bool {
        self.data || self.log || self.images
    }
}

/// `DATA:FILEPATH` with a trailing `/` and spaces replaced by `_`.
pub fn experiment_filepath(raw: &str) -> String {
    let mut path = raw.trim().replace(' ', "_");
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

pub struct Experiment {
    ctx: ScanContext,
    sample_name: String,
    filepath: String,
    outputs: OutputFlags,
    options: ScanOptions,
    devices: [Option<ScanDevice>; DEVICE_SLOTS],
    shutters: Vec<Option<Arc<Shutter>>>,
    grabber: Option<Box<dyn ImageGrabber>>,
    correction: Option<ScanCorrection>,
    logger: Option<DataLogger>,
}

impl Experiment {
    /// Build everything a scan needs.
    ///
    /// Fails before any hardware is moved when the output directory already
    /// exists, a configured PV is unreachable or the shutter setup cannot
    /// serve the requested acquisition.
    pub fn from_config(ctx: &ScanContext) -> Result<Self, ScanError> {
        let sample_name = ctx.string("SCAN:SAMPLE_NAME").replace(' ', "_");
        let outputs = OutputFlags::from_config(ctx);
        let options = ScanOptions::from_config(ctx);
        ctx.config_pv("MSG_SEVR").put(0)?;

        let filepath = experiment_filepath(&ctx.string("DATA:FILEPATH"));
        if outputs.any() {
            create_output_dir(ctx, &filepath)?;
        }

        let log_path = format!("{}{}.log", filepath, ctx.started());
        ctx.config_pv("LOG:FILENAME").put_str(&log_path)?;
        if outputs.log {
            ctx.status().console().tee_to(Path::new(&log_path))?;
        }

        let mut devices: [Option<ScanDevice>; DEVICE_SLOTS] = Default::default();
        for (slot, device) in devices.iter_mut().enumerate() {
            *device = ScanDevice::from_config(ctx, slot + 1)?;
        }

        let shutters = (1..=SHUTTER_SLOTS)
            .map(|n| Shutter::from_config(ctx, n).map(|s| s.map(Arc::new)))
            .collect::<Result<Vec<_>, _>>()?;
        for shutter in shutters.iter().flatten() {
            shutter.record_initial()?;
        }
        validate_shutters(&options, &shutters)?;

        let camera = ctx.string("GRABIMAGES:CAMERA");
        let grabber = if camera.is_empty() {
            debug!("No camera configured");
            None
        } else {
            let grabber = grabber::from_config(ctx, &filepath, &sample_name)?;
            grabber.prepare_output(options.mode != ScanMode::None && outputs.images)?;
            Some(grabber)
        };

        let correction = match options.mode {
            ScanMode::OneD | ScanMode::TwoD if ctx.flag("SCANCOR:ENABLE") => {
                Some(ScanCorrection::from_config(ctx)?)
            }
            _ => None,
        };

        let logger = if outputs.data {
            let monitor = grabber.as_ref().map(|g| g.monitor_pvs()).unwrap_or_default();
            let extra = logged_hardware(&devices, &shutters);
            Some(DataLogger::from_config(ctx, &filepath, monitor, extra)?)
        } else {
            None
        };

        debug!("Scan mode: {}", options.mode);
        Ok(Self {
            ctx: ctx.clone(),
            sample_name,
            filepath,
            outputs,
            options,
            devices,
            shutters,
            grabber,
            correction,
            logger,
        })
    }

    pub fn sample_name(&self) -> &str {
        &self.sample_name
    }

    pub fn filepath(&self) -> &str {
        &self.filepath
    }

    pub fn outputs(&self) -> OutputFlags {
        self.outputs
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn devices(&self) -> &[Option<ScanDevice>] {
        &self.devices
    }

    pub fn shutters(&self) -> &[Option<Arc<Shutter>>] {
        &self.shutters
    }

    pub fn data_logger(&self) -> Option<&DataLogger> {
        self.logger.as_ref()
    }

    /// Banner with scan mode, scan ID and the types of the swept devices.
    pub fn print_scan_info(&self) {
        let status = self.ctx.status();
        status.print_raw(&"#".repeat(32));
        status.print_raw(&format!("Scan mode: {}", self.options.mode));
        status.print_raw(&format!("Scan ID: {}", self.ctx.string("SCAN:ID")));

        let describe = |slot: usize| match &self.devices[slot] {
            Some(device) => format!("PV #{} type: {}", slot + 1, device.kind()),
            None => format!("PV #{} type: No PV entered", slot + 1),
        };
        match self.options.mode {
            ScanMode::OneD => {
                if let Some(slot) = self.devices.iter().position(Option::is_some) {
                    status.print_raw(&describe(slot));
                }
            }
            ScanMode::TwoD => {
                status.print_raw(&describe(0));
                status.print_raw(&describe(1));
            }
            _ => {}
        }
        status.print_raw(&"#".repeat(32));
    }

    /// Publish the PID, log data in the background and run the sweep.
    ///
    /// The data logger is stopped whatever the scan outcome; a scan error
    /// takes precedence over a logger error.
    pub fn run(mut self, interrupt: Arc<AtomicBool>) -> Result<(), ScanError> {
        let status = self.ctx.status().clone();
        self.ctx.pid_pv().put(std::process::id())?;

        let mut logging = match self.logger.take() {
            Some(logger) => Some(logger.start(&status)?),
            None => None,
        };
        self.print_scan_info();
        let trigger = grabber::trigger_command(&self.ctx);

        let Self {
            ctx,
            options,
            devices,
            shutters,
            grabber,
            correction,
            ..
        } = self;

        let components = ScanComponents {
            devices,
            grabber,
            shutters,
            correction,
            trigger,
        };
        let mut driver = ScanDriver::new(&ctx, options, components).with_interrupt(interrupt);

        status.print_msg("Starting");
        // Collect some data before anything moves
        pause(ctx.timing().idle);
        let scanned = driver.run();
        if scanned.is_ok() {
            pause(ctx.timing().idle);
            status.print_msg("Done");
        }

        let logged = match logging.as_mut() {
            Some(handle) => handle.stop(),
            None => Ok(()),
        };
        if let Err(e) = &logged {
            warn!("Data logger: {}", e);
        }
        info!("Scan finished: {:?}", scanned.as_ref().err());
        scanned.and(logged)
    }
}

fn create_output_dir(ctx: &ScanContext, filepath: &str) -> Result<(), ScanError> {
    if filepath == "/" {
        return Err(ScanError::Config(format!(
            "{}:DATA:FILEPATH is empty",
            ctx.prefix()
        )));
    }
    let dir = Path::new(filepath);
    if dir.exists() {
        return Err(ScanError::FilepathExists(dir.to_path_buf()));
    }
    std::fs::create_dir_all(dir).map_err(|e| ScanError::io(e, format!("creating {}", filepath)))
}

fn validate_shutters(
    options: &ScanOptions,
    shutters: &[Option<Arc<Shutter>>],
) -> Result<(), ScanError> {
    let acquisition = &options.acquisition;
    if !acquisition.uses_shutters() {
        return Ok(());
    }
    let configured: Vec<&Arc<Shutter>> = shutters.iter().flatten().collect();
    if configured.len() < 2 {
        return Err(ScanError::Shutter(
            "Need at least two shutters enabled".to_string(),
        ));
    }
    if acquisition.check {
        if let Some(bad) = configured.iter().find(|s| !s.has_valid_readback()) {
            return Err(ScanError::Shutter(format!(
                "Verify shutters enabled, but shutter {} has invalid RBV",
                bad.number()
            )));
        }
    }
    Ok(())
}

/// Device setpoints, shutter controls and shutter readbacks.
fn logged_hardware(devices: &[Option<ScanDevice>], shutters: &[Option<Arc<Shutter>>]) -> Vec<Pv> {
    let setpoints = devices
        .iter()
        .flatten()
        .map(|d| d.handles().setpoint.clone());
    let controls = shutters.iter().flatten().map(|s| s.control().clone());
    let readbacks = shutters.iter().flatten().filter_map(|s| s.readback().cloned());
    setpoints.chain(controls).chain(readbacks).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::PvValue;
    use crate::testing::{configure_device, configure_shutter, sim_context};

    #[test]
    fn test_experiment_filepath() {
        assert_eq!(experiment_filepath("/data/my run"), "/data/my_run/");
        assert_eq!(experiment_filepath("/data/run/"), "/data/run/");
    }

    #[test]
    fn test_existing_filepath_fails_before_motion() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, ctx) = sim_context();
        configure_device(&sim, 1, "PHASE:SET", (0.0, 1.0, 2), 0.0);
        sim.set("TEST:DATA:ENABLE", 1);
        sim.set("TEST:DATA:FILEPATH", dir.path().to_string_lossy().as_ref());

        let err = Experiment::from_config(&ctx).err();
        assert!(matches!(err, Some(ScanError::FilepathExists(_))));
        assert!(sim.writes_to("PHASE:SET").is_empty());
    }

    #[test]
    fn test_one_shutter_cannot_serve_pump_probe() {
        let (sim, ctx) = sim_context();
        configure_shutter(&sim, 1, 0);
        sim.set("TEST:ACQ:FIXED", 0);
        sim.set("TEST:ACQ:PUMP_PROBE", 1);

        let err = Experiment::from_config(&ctx).err();
        assert!(matches!(err, Some(ScanError::Shutter(_))));
        // Initial state is recorded before validation
        assert_eq!(sim.value("TEST:SHUTTER1:INITIAL"), Some(PvValue::Double(0.0)));
    }

    #[test]
    fn test_shutter_check_requires_readbacks() {
        let (sim, ctx) = sim_context();
        configure_shutter(&sim, 1, 0);
        configure_shutter(&sim, 2, 1);
        sim.disconnect("LASER:SHUTTER2:RBV");
        sim.set("TEST:ACQ:STATIC", 1);
        sim.set("TEST:SHUTTERS:CHECK", 1);

        match Experiment::from_config(&ctx) {
            Err(ScanError::Shutter(msg)) => assert!(msg.contains("shutter 2 has invalid RBV")),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_one_d_run_with_data_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run1");
        let (sim, ctx) = sim_context();
        configure_device(&sim, 1, "PHASE:SET", (0.0, 10.0, 3), 1.0);
        configure_shutter(&sim, 1, 1);
        sim.set("TEST:SCAN:MODE", 1);
        sim.set("TEST:SCAN:ID", "sample_001");
        sim.set("TEST:DATA:ENABLE", 1);
        sim.set("TEST:DATA:INT", 0.01);
        sim.set("TEST:LOG:ENABLE", 1);
        sim.set("TEST:DATA:FILEPATH", out.to_string_lossy().as_ref());

        let exp = Experiment::from_config(&ctx).unwrap();
        assert!(out.is_dir());
        let logged: Vec<&str> = exp.data_logger().unwrap().pvs().iter().map(|p| p.name()).collect();
        assert_eq!(logged, vec!["PHASE:SET", "LASER:SHUTTER1", "LASER:SHUTTER1:RBV"]);

        exp.run(Arc::new(AtomicBool::new(false))).unwrap();

        assert_eq!(
            sim.value("TEST:PID"),
            Some(PvValue::Int(std::process::id() as i64))
        );
        assert_eq!(sim.value("PHASE:SET"), Some(PvValue::Double(1.0)));

        let started = ctx.started().to_string();
        let log = std::fs::read_to_string(out.join(format!("{}.log", started))).unwrap();
        assert!(log.contains("Scan mode: 1-D"));
        assert!(log.contains("PV #1 type: PV"));
        assert!(log.contains("Setting PHASE:SET to 5.000000"));
        let data = std::fs::read_to_string(out.join(format!("{}.dat", started))).unwrap();
        assert!(data.contains("Timestamp PHASE:SET LASER:SHUTTER1 LASER:SHUTTER1:RBV"));
    }

    #[test]
    fn test_no_outputs_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("unused");
        let (sim, ctx) = sim_context();
        sim.set("TEST:DATA:FILEPATH", out.to_string_lossy().as_ref());

        let exp = Experiment::from_config(&ctx).unwrap();
        assert!(!out.exists());
        assert!(exp.data_logger().is_none());
        assert_eq!(exp.options().mode, ScanMode::None);
        exp.run(Arc::new(AtomicBool::new(false))).unwrap();
        assert!(ctx
            .status()
            .console()
            .lines()
            .iter()
            .any(|l| l.ends_with(" Done")));
    }
}
