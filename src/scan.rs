//! N-dimensional scan driver.
//!
//! Sweeps zero, one or two devices and runs the configured acquisition at
//! every innermost step. Errors from devices, shutters or the grabber are
//! not retried: they end the scan and surface at the binary boundary.

use crate::context::{ScanContext, StatusChannel, Timing};
use crate::correction::ScanCorrection;
use crate::device::{Movable, ScanDevice};
use crate::error::ScanError;
use crate::grabber::{grab_with_trigger, GrabSettings, ImageGrabber};
use crate::shutter::{Shutter, ShutterGroup, ShutterState};
use crate::utils::{pause, secs};
use log::{debug, error, info, warn};
use std::fmt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Threshold used by shutter readback verification.
pub const SHUTTER_CHECK_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    None,
    OneD,
    TwoD,
    GrabOnly,
}

impl ScanMode {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ScanMode::OneD,
            2 => ScanMode::TwoD,
            3 => ScanMode::GrabOnly,
            _ => ScanMode::None,
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanMode::None => "None",
            ScanMode::OneD => "1-D",
            ScanMode::TwoD => "2-D",
            ScanMode::GrabOnly => "Grab images only",
        };
        write!(f, "{}", label)
    }
}

/// Shutter-driven acquisition sequences, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqSequence {
    /// Both shutters open
    PumpProbe,
    /// Shutter 1 open, shutter 2 closed
    Static,
    /// Shutter 1 closed, shutter 2 open
    PumpBackground,
    /// Both shutters closed
    DarkCurrent,
}

impl AcqSequence {
    pub const ALL: [AcqSequence; 4] = [
        AcqSequence::PumpProbe,
        AcqSequence::Static,
        AcqSequence::PumpBackground,
        AcqSequence::DarkCurrent,
    ];

    /// File name tag prepended to the step extras.
    pub fn tag(self) -> &'static str {
        match self {
            AcqSequence::PumpProbe => "PumpProbe",
            AcqSequence::Static => "Static",
            AcqSequence::PumpBackground => "PumpBG",
            AcqSequence::DarkCurrent => "DarkCurrent",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AcqSequence::PumpProbe => "pump-probe",
            AcqSequence::Static => "static",
            AcqSequence::PumpBackground => "pump BG",
            AcqSequence::DarkCurrent => "dark current",
        }
    }

    /// Target states of shutters 1 and 2.
    pub fn shutter_states(self) -> (ShutterState, ShutterState) {
        use ShutterState::{Closed, Open};
        match self {
            AcqSequence::PumpProbe => (Open, Open),
            AcqSequence::Static => (Open, Closed),
            AcqSequence::PumpBackground => (Closed, Open),
            AcqSequence::DarkCurrent => (Closed, Closed),
        }
    }

    fn announce(self, first: usize, second: usize) -> String {
        match self {
            AcqSequence::PumpProbe => format!("Opening shutters {} and {}", first, second),
            AcqSequence::Static => format!("Opening shutter {}, closing shutter {}", first, second),
            AcqSequence::PumpBackground => {
                format!("Closing shutter {}, opening shutter {}", first, second)
            }
            AcqSequence::DarkCurrent => "Closing both shutters".to_string(),
        }
    }
}

/// Per-step acquisition choice (`ACQ:*`, `SHUTTERS:*`).
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// One plain grab per step, no shutter handling
    pub fixed: bool,
    pub sequences: Vec<AcqSequence>,
    /// Pause after pump-probe, static and pump BG, when a later sequence runs
    pub delays: [Duration; 3],
    pub check: bool,
    pub restore: bool,
}

impl Acquisition {
    pub fn from_config(ctx: &ScanContext) -> Self {
        let keys = ["ACQ:PUMP_PROBE", "ACQ:STATIC", "ACQ:PUMP_BG", "ACQ:DARK_CURRENT"];
        let sequences = AcqSequence::ALL
            .into_iter()
            .zip(keys)
            .filter(|(_, key)| ctx.flag(key))
            .map(|(seq, _)| seq)
            .collect();
        Self {
            fixed: ctx.flag("ACQ:FIXED"),
            sequences,
            delays: [
                secs(ctx.f64_or("ACQ:DELAY1", 0.0)),
                secs(ctx.f64_or("ACQ:DELAY2", 0.0)),
                secs(ctx.f64_or("ACQ:DELAY3", 0.0)),
            ],
            check: ctx.flag("SHUTTERS:CHECK"),
            restore: ctx.flag("SHUTTERS:RESTORE"),
        }
    }

    /// Whether this acquisition drives shutters at all.
    pub fn uses_shutters(&self) -> bool {
        !self.fixed && !self.sequences.is_empty()
    }

    fn delay_after(&self, index: usize) -> Duration {
        let seq = self.sequences[index];
        let later = index + 1 < self.sequences.len();
        match AcqSequence::ALL.iter().position(|s| *s == seq) {
            Some(slot) if later && slot < 3 => self.delays[slot],
            _ => Duration::ZERO,
        }
    }
}

impl Default for Acquisition {
    fn default() -> Self {
        Self {
            fixed: true,
            sequences: Vec::new(),
            delays: [Duration::ZERO; 3],
            check: false,
            restore: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub mode: ScanMode,
    pub pre_scan: bool,
    pub run_script: bool,
    pub acquisition: Acquisition,
}

impl ScanOptions {
    pub fn from_config(ctx: &ScanContext) -> Self {
        Self {
            mode: ScanMode::from_code(ctx.i64_or("SCAN:MODE", 0)),
            pre_scan: ctx.flag("SCAN:PRESCAN"),
            run_script: ctx.flag("RUNSCRIPT:ENABLE"),
            acquisition: Acquisition::from_config(ctx),
        }
    }
}

/// Hardware the driver works on.
#[derive(Default)]
pub struct ScanComponents {
    /// Configuration slots 1 and 2
    pub devices: [Option<ScanDevice>; 2],
    pub grabber: Option<Box<dyn ImageGrabber>>,
    /// Shutters by number; index 0 is shutter 1
    pub shutters: Vec<Option<Arc<Shutter>>>,
    pub correction: Option<ScanCorrection>,
    /// Single-shot trigger run alongside every grab
    pub trigger: Option<Vec<String>>,
}

/// Run `RUNSCRIPT:PATH` once. An empty path is logged and skipped.
pub fn run_user_script(ctx: &ScanContext) -> Result<(), ScanError> {
    let path = ctx.string("RUNSCRIPT:PATH");
    let argv: Vec<&str> = path.split_whitespace().collect();
    let Some((program, args)) = argv.split_first() else {
        error!("User script path is zero length");
        return Ok(());
    };

    ctx.status().print_msg("Running user script...");
    let status = Command::new(program).args(args).status().map_err(|e| {
        let msg = format!("{}: {}", program, e);
        ctx.status().fail(&format!("runUserScript: {}", e));
        ScanError::UserScript(msg)
    })?;
    if !status.success() {
        warn!("User script {} exited with {}", program, status);
    }
    Ok(())
}

pub struct ScanDriver {
    mode: ScanMode,
    options: ScanOptions,
    /// Swept devices, outermost first
    axes: Vec<ScanDevice>,
    grabber: Option<Box<dyn ImageGrabber>>,
    shutters: Vec<Option<Arc<Shutter>>>,
    correction: Option<ScanCorrection>,
    trigger: Option<Vec<String>>,
    ctx: ScanContext,
    status: StatusChannel,
    timing: Timing,
    interrupt: Arc<AtomicBool>,
}

impl ScanDriver {
    /// Resolve which devices are swept.
    ///
    /// A 1-D or 2-D scan with only slot 2 filled sweeps that device as a 1-D
    /// scan. A 2-D scan without a second device sweeps the first one alone.
    pub fn new(ctx: &ScanContext, options: ScanOptions, components: ScanComponents) -> Self {
        let ScanComponents {
            devices: [first, second],
            grabber,
            shutters,
            correction,
            trigger,
        } = components;

        let mut mode = options.mode;
        let axes = match (mode, first, second) {
            (ScanMode::OneD | ScanMode::TwoD, None, Some(only)) => {
                debug!("Only PV #2 configured, scanning it as PV #1");
                mode = ScanMode::OneD;
                vec![only]
            }
            (ScanMode::OneD, Some(first), _) => vec![first],
            (ScanMode::TwoD, Some(first), Some(second)) => vec![first, second],
            (ScanMode::TwoD, Some(first), None) => {
                warn!("Scan mode 2-D selected but no PV #2");
                vec![first]
            }
            _ => Vec::new(),
        };

        Self {
            mode,
            options,
            axes,
            grabber,
            shutters,
            correction,
            trigger,
            ctx: ctx.clone(),
            status: ctx.status().clone(),
            timing: ctx.timing().clone(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between steps; set it to stop after the current step.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn axes(&self) -> &[ScanDevice] {
        &self.axes
    }

    pub fn grabber(&self) -> Option<&dyn ImageGrabber> {
        self.grabber.as_deref()
    }

    /// Hand the grabber back, e.g. for an abort after an interrupted scan.
    pub fn take_grabber(&mut self) -> Option<Box<dyn ImageGrabber>> {
        self.grabber.take()
    }

    pub fn run(&mut self) -> Result<(), ScanError> {
        match self.mode {
            ScanMode::OneD | ScanMode::TwoD if !self.axes.is_empty() => self.run_sweep(),
            ScanMode::GrabOnly => self.run_grab_only(),
            _ => {
                self.status
                    .print_msg("Scan mode \"None\" selected or no PVs entered, continuing...");
                pause(self.timing.idle);
                Ok(())
            }
        }
    }

    fn check_interrupt(&self) -> Result<(), ScanError> {
        if self.interrupt.load(Ordering::Relaxed) {
            self.status.print_msg("Scan interrupted");
            return Err(ScanError::Interrupted);
        }
        Ok(())
    }

    fn grab_settings(&self) -> Option<GrabSettings> {
        self.grabber
            .as_ref()
            .map(|g| g.settings().clone())
            .filter(|s| s.enabled)
    }

    fn extras(&self) -> String {
        self.grabber
            .as_ref()
            .map(|g| g.filename_extras().to_string())
            .unwrap_or_default()
    }

    fn set_extras(&mut self, extras: String) {
        if let Some(grabber) = self.grabber.as_mut() {
            grabber.set_filename_extras(extras);
        }
    }

    fn grab(&mut self, count: Option<u32>) -> Result<(), ScanError> {
        let Some(grabber) = self.grabber.as_deref_mut() else {
            return Ok(());
        };
        match &self.trigger {
            Some(argv) => grab_with_trigger(grabber, count, argv),
            None => grabber.grab_images(count),
        }
    }

    fn wait_for_new_image(&mut self) -> Result<(), ScanError> {
        match self.grabber.as_mut() {
            Some(grabber) => grabber.wait_for_new_image(),
            None => Ok(()),
        }
    }

    fn stop_acquisition(&mut self) -> Result<(), ScanError> {
        let Some(grabber) = self.grabber.as_mut() else {
            return Ok(());
        };
        if grabber.settings().stop_acquisition {
            self.status.print_msg("Stopping camera acquisition");
            grabber.stop_acquire()?;
        }
        Ok(())
    }

    fn announce_sweep(&self, axis: usize) {
        let device = &self.axes[axis];
        let params = device.params();
        if params.random {
            self.status
                .print_msg(&format!("Scanning {} randomly", device.name()));
        } else {
            self.status.print_msg(&format!(
                "Scanning {} from {:.6} to {:.6} in {} steps",
                device.name(),
                params.start,
                params.stop,
                device.positions().len()
            ));
        }
    }

    /// Move one axis to `target` and let it settle. Step numbers are 1-based.
    fn set_axis(&self, axis: usize, target: f64, step: usize) -> Result<(), ScanError> {
        let device = &self.axes[axis];
        self.status
            .print_msg(&format!("Setting {} to {:.6}", device.name(), target));
        let settle = device.move_to(target)?;
        debug!("{} settle: {:?}", device.name(), settle);
        if axis == 0 {
            if let Some(correction) = &self.correction {
                correction.set(target)?;
            }
        }
        device.publish_step(step)?;
        self.status
            .print_sleep(device.params().settle_time, "Settling");
        Ok(())
    }

    /// File name part for one axis: `_<desc>[-<step>]-<value>`.
    fn axis_label(&self, axis: usize, step: usize, with_step: bool) -> String {
        let device = &self.axes[axis];
        let value = device.position().unwrap_or(f64::NAN);
        if with_step {
            format!("_{}-{:03}-{:08.4}", device.description(), step, value)
        } else {
            format!("_{}-{:08.4}", device.description(), value)
        }
    }

    fn run_sweep(&mut self) -> Result<(), ScanError> {
        if let Some(correction) = &self.correction {
            correction.plot();
        }
        let initial: Vec<Option<f64>> = self.axes.iter().map(|d| d.position()).collect();

        let swept = self.sweep();
        if let Err(e) = &swept {
            if !matches!(e, ScanError::Interrupted) {
                return swept;
            }
        }

        self.stop_acquisition()?;
        self.restore_positions(&initial)?;
        swept
    }

    fn sweep(&mut self) -> Result<(), ScanError> {
        if self.options.pre_scan {
            self.pre_scan()?;
        }

        self.announce_sweep(0);
        let outer = self.axes[0].positions().to_vec();
        let inner = self.axes.get(1).map(|d| d.positions().to_vec());

        for (i, &x) in outer.iter().enumerate() {
            self.check_interrupt()?;
            let step1 = i + 1;
            self.set_axis(0, x, step1)?;

            match &inner {
                Some(inner) => {
                    self.announce_sweep(1);
                    for (j, &y) in inner.iter().enumerate() {
                        self.check_interrupt()?;
                        let step2 = j + 1;
                        self.set_axis(1, y, step2)?;
                        self.acquire_step(&[(0, step1), (1, step2)], step1 == 1 && step2 == 1)?;
                    }
                }
                None => self.acquire_step(&[(0, step1)], step1 == 1)?,
            }
        }
        Ok(())
    }

    fn restore_positions(&mut self, initial: &[Option<f64>]) -> Result<(), ScanError> {
        for (axis, start) in initial.iter().enumerate() {
            let device = &self.axes[axis];
            match start {
                Some(value) => {
                    self.status.print_msg(&format!(
                        "Setting {} back to initial position: {:.6}",
                        device.name(),
                        value
                    ));
                    device.move_to(*value)?;
                }
                None => warn!("Initial position of {} unknown, not restoring", device.name()),
            }
            if axis == 0 {
                if let Some(correction) = &self.correction {
                    correction.reset()?;
                }
            }
        }
        Ok(())
    }

    fn pre_scan(&mut self) -> Result<(), ScanError> {
        let device = &self.axes[0];
        let Some(range) = device.params().pre_scan.clone() else {
            warn!("Pre-scan enabled but {} has no pre-scan range", device.name());
            return Ok(());
        };
        let positions = range.positions()?;

        self.status
            .print_msg(&format!("Doing pre-scan {}", "-".repeat(20)));
        self.status.print_msg(&format!(
            "Scanning {} from {:.6} to {:.6} in {} steps",
            device.name(),
            range.start,
            range.stop,
            range.step_count
        ));

        for (i, &x) in positions.iter().enumerate() {
            self.check_interrupt()?;
            let device = &self.axes[0];
            self.status
                .print_msg(&format!("Setting {} to {:.6}", device.name(), x));
            device.move_to(x)?;
            self.status
                .print_sleep(device.params().settle_time, "Settling");

            if let Some(settings) = self.grab_settings() {
                let label = self.axis_label(0, i + 1, settings.step_number);
                self.set_extras(format!("_prescan{}", label));
                self.grab(None)?;
            }
        }
        self.status
            .print_msg(&format!("Pre-scan done {}", "-".repeat(20)));
        Ok(())
    }

    /// Everything that happens once the axes of a step have settled.
    fn acquire_step(&mut self, axes: &[(usize, usize)], first_step: bool) -> Result<(), ScanError> {
        if self.options.run_script {
            run_user_script(&self.ctx)?;
        }
        let Some(settings) = self.grab_settings() else {
            return Ok(());
        };

        if first_step {
            self.wait_for_new_image()?;
        }
        let extras: String = axes
            .iter()
            .map(|&(axis, step)| self.axis_label(axis, step, settings.step_number))
            .collect();
        self.set_extras(extras);

        if settings.second_sequence {
            self.pumped_sequence(&settings)?;
        }
        self.acquire()
    }

    fn run_grab_only(&mut self) -> Result<(), ScanError> {
        if self.options.run_script {
            run_user_script(&self.ctx)?;
        }
        if let Some(settings) = self.grab_settings() {
            self.wait_for_new_image()?;
            if settings.second_sequence {
                self.pumped_sequence(&settings)?;
            }
            self.grab(None)?;
        }
        self.stop_acquisition()
    }

    fn shutter(&self, number: usize) -> Result<Arc<Shutter>, ScanError> {
        self.shutters
            .get(number - 1)
            .cloned()
            .flatten()
            .ok_or_else(|| ScanError::Shutter(format!("shutter {} is not configured", number)))
    }

    /// Second image count with shutters 1-3 open, tagged `Pumped`; the
    /// following grab is tagged `Static`.
    fn pumped_sequence(&mut self, settings: &GrabSettings) -> Result<(), ScanError> {
        self.status.print_msg("Starting pumped image sequence");
        pause(self.timing.sequence_pause);

        let members = (1..=3)
            .map(|n| self.shutter(n))
            .collect::<Result<Vec<_>, _>>()?;
        let states: Vec<ShutterState> = members.iter().map(|s| s.state()).collect();
        let group = ShutterGroup::new(members);

        self.status.print_msg("Opening shutters 1, 2 and 3");
        group.open()?;
        pause(self.timing.sequence_pause);

        let extras = self.extras();
        let pumped = if extras.contains("Static") {
            extras.replace("Static", "Pumped")
        } else {
            format!("_Pumped{}", extras)
        };
        self.set_extras(pumped);
        self.grab(Some(settings.second_count))?;

        self.status.print_msg("Returning shutters to initial state");
        for (shutter, state) in group.members().iter().zip(states) {
            shutter.restore(state)?;
        }
        pause(self.timing.sequence_pause);

        let extras = self.extras();
        let next = if extras.contains("Pumped") {
            extras.replace("Pumped", "Static")
        } else {
            "_Static".to_string()
        };
        self.set_extras(next);

        self.status.print_msg("Finished pumped image sequence");
        self.status.print_sleep(settings.second_delay, "Pausing");
        Ok(())
    }

    fn acquire(&mut self) -> Result<(), ScanError> {
        if self.options.acquisition.fixed {
            return self.grab(None);
        }
        let sequences = self.options.acquisition.sequences.clone();
        for (index, seq) in sequences.into_iter().enumerate() {
            self.run_sequence(seq)?;
            let delay = self.options.acquisition.delay_after(index);
            self.status.print_sleep(delay, "Pausing");
        }
        Ok(())
    }

    fn run_sequence(&mut self, seq: AcqSequence) -> Result<(), ScanError> {
        let first = self.shutter(1)?;
        let second = self.shutter(2)?;
        let check = self.options.acquisition.check;
        let restore = self.options.acquisition.restore;

        self.status
            .print_msg(&format!("Starting {} acquisition", seq.label()));
        let initial = restore.then(|| (first.state(), second.state()));

        self.status
            .print_msg(&seq.announce(first.number(), second.number()));
        let (a, b) = seq.shutter_states();
        first.restore(a)?;
        second.restore(b)?;
        pause(self.timing.shutter_pause);

        if check {
            debug!("Checking shutters for {} acquisition", seq.label());
            for (shutter, state) in [(&first, a), (&second, b)] {
                match state {
                    ShutterState::Open => shutter.open_check(SHUTTER_CHECK_THRESHOLD)?,
                    ShutterState::Closed => shutter.close_check(SHUTTER_CHECK_THRESHOLD)?,
                }
            }
        }

        let previous = self.extras();
        self.set_extras(format!("_{}{}", seq.tag(), previous));
        self.grab(None)?;

        if let Some((state1, state2)) = initial {
            self.status.print_msg("Returning shutters to initial state");
            first.restore(state1)?;
            second.restore(state2)?;
            pause(self.timing.shutter_pause);
        }
        self.set_extras(previous);
        self.status
            .print_msg(&format!("Finished {} acquisition", seq.label()));
        info!("{} acquisition done", seq.tag());
        Ok(())
    }
}
