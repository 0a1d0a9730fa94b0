//! Out-of-band abort of a running scan.
//!
//! Runs as its own process with its own PV handles. Every step is attempted
//! even when an earlier one fails; failures are logged and collected in the
//! returned [`AbortReport`].

use crate::context::ScanContext;
use crate::device::DeviceHandles;
use crate::error::ScanError;
use crate::experiment::{experiment_filepath, DEVICE_SLOTS, SHUTTER_SLOTS};
use crate::grabber;
use crate::shutter::{Shutter, ShutterState};
use log::{debug, error, info, warn};

/// Something that can terminate a process by PID.
pub trait ProcessKiller {
    fn kill(&self, pid: i32) -> Result<(), ScanError>;
}

/// Sends `SIGKILL`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalKiller;

#[cfg(unix)]
impl ProcessKiller for SignalKiller {
    fn kill(&self, pid: i32) -> Result<(), ScanError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| ScanError::Signal(format!("kill {}: {}", pid, e)))
    }
}

#[cfg(not(unix))]
impl ProcessKiller for SignalKiller {
    fn kill(&self, pid: i32) -> Result<(), ScanError> {
        Err(ScanError::Signal(format!(
            "cannot signal process {} on this platform",
            pid
        )))
    }
}

/// What an abort did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AbortReport {
    pub killed: Option<i32>,
    pub devices_stopped: usize,
    pub shutters_restored: usize,
    pub grabber_aborted: bool,
    pub failures: Vec<String>,
}

impl AbortReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &str, err: ScanError) {
        error!("Abort: {}: {}", step, err);
        self.failures.push(format!("{}: {}", step, err));
    }
}

pub struct AbortController<K: ProcessKiller = SignalKiller> {
    ctx: ScanContext,
    killer: K,
}

impl AbortController<SignalKiller> {
    pub fn new(ctx: &ScanContext) -> Self {
        Self::with_killer(ctx, SignalKiller)
    }
}

impl<K: ProcessKiller> AbortController<K> {
    pub fn with_killer(ctx: &ScanContext, killer: K) -> Self {
        Self {
            ctx: ctx.clone(),
            killer,
        }
    }

    /// Kill the scan, stop the wrapper and drive hardware to a safe state.
    pub fn abort(&self) -> AbortReport {
        let status = self.ctx.status();
        let mut report = AbortReport::default();
        status.print_msg("Aborting...");

        self.kill_scan(&mut report);

        status.print_msg("Stopping wrapper script");
        if let Err(e) = self.ctx.run_flag_pv().put(0) {
            report.record("run flag", e);
        }

        status.print_msg("Stopping move(s)");
        self.stop_devices(&mut report);

        status.print_msg("Restoring shutters");
        self.restore_shutters(&mut report);

        self.abort_grabber(&mut report);

        status.print_msg("Aborted");
        info!(
            "Abort finished with {} failure(s)",
            report.failures.len()
        );
        report
    }

    fn kill_scan(&self, report: &mut AbortReport) {
        let Some(pid) = self.ctx.pid_pv().get_i64() else {
            report.record("kill", ScanError::Signal("scan PID unreadable".to_string()));
            return;
        };
        let pid = match i32::try_from(pid) {
            Ok(pid) if pid > 0 && pid as u32 != std::process::id() => pid,
            _ => {
                report.record("kill", ScanError::Signal(format!("refusing to kill PID {}", pid)));
                return;
            }
        };

        self.ctx
            .status()
            .print_msg(&format!("Killing process {}...", pid));
        match self.killer.kill(pid) {
            Ok(()) => report.killed = Some(pid),
            Err(e) => report.record("kill", e),
        }
    }

    fn stop_devices(&self, report: &mut AbortReport) {
        for slot in 1..=DEVICE_SLOTS {
            let stopped = DeviceHandles::from_config(&self.ctx, slot).and_then(|handles| {
                match handles {
                    Some(handles) => handles.stop(),
                    None => Ok(false),
                }
            });
            match stopped {
                Ok(true) => report.devices_stopped += 1,
                Ok(false) => debug!("PV #{}: nothing to stop", slot),
                Err(e) => report.record(&format!("stop PV #{}", slot), e),
            }
        }
    }

    fn restore_shutters(&self, report: &mut AbortReport) {
        for number in 1..=SHUTTER_SLOTS {
            let shutter = match Shutter::from_config(&self.ctx, number) {
                Ok(Some(shutter)) => shutter,
                Ok(None) => continue,
                Err(e) => {
                    report.record(&format!("shutter {}", number), e);
                    continue;
                }
            };
            let Some(initial) = shutter.initial_state() else {
                warn!("Shutter {}: no recorded initial state, closing", number);
                match shutter.close() {
                    Ok(()) => report.shutters_restored += 1,
                    Err(e) => report.record(&format!("shutter {}", number), e),
                }
                continue;
            };
            let verb = match initial {
                ShutterState::Open => "Opening",
                ShutterState::Closed => "Closing",
            };
            self.ctx
                .status()
                .print_msg(&format!("{} shutter {}", verb, number));
            match shutter.restore(initial) {
                Ok(()) => report.shutters_restored += 1,
                Err(e) => report.record(&format!("shutter {}", number), e),
            }
        }
    }

    fn abort_grabber(&self, report: &mut AbortReport) {
        if self.ctx.string("GRABIMAGES:CAMERA").is_empty() {
            return;
        }
        let filepath = experiment_filepath(&self.ctx.string("DATA:FILEPATH"));
        let sample = self.ctx.string("SCAN:SAMPLE_NAME");
        let aborted = grabber::from_config(&self.ctx, &filepath, &sample)
            .and_then(|mut grabber| grabber.abort());
        match aborted {
            Ok(()) => {
                self.ctx.status().print_msg("Image grabbing aborted");
                report.grabber_aborted = true;
            }
            Err(e) => report.record("grabber", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::PvValue;
    use crate::testing::{configure_shutter, sim_context};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingKiller {
        killed: Mutex<Vec<i32>>,
    }

    impl ProcessKiller for &RecordingKiller {
        fn kill(&self, pid: i32) -> Result<(), ScanError> {
            self.killed.lock().push(pid);
            Ok(())
        }
    }

    #[test]
    fn test_abort_restores_recorded_state() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:PID", 424242);
        sim.set("TEST:RUNFLAG", 1);

        // Motor in slot 1
        sim.set("TEST:SCANPV1:PVNAME", "MOTR:X");
        sim.set("TEST:SCANPV1:PVTYPE", 1);
        sim.set("MOTR:X", 3.0);

        // Shutter 1 was open before the scan, shutter 2 closed
        configure_shutter(&sim, 1, 0);
        configure_shutter(&sim, 2, 1);
        sim.set("TEST:SHUTTER1:INITIAL", 1.0);
        sim.set("TEST:SHUTTER2:INITIAL", 0.0);

        sim.set("TEST:GRABIMAGES:CAMERA", "CAM1");
        sim.set("CAM1:TIFF1:Capture", 1);

        let killer = RecordingKiller::default();
        let report = AbortController::with_killer(&ctx, &killer).abort();

        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(*killer.killed.lock(), vec![424242]);
        assert_eq!(report.killed, Some(424242));
        assert_eq!(sim.value("TEST:RUNFLAG"), Some(PvValue::Int(0)));
        assert_eq!(sim.writes_to("MOTR:X.STOP"), vec![PvValue::Int(1)]);
        assert_eq!(sim.writes_to("LASER:SHUTTER1"), vec![PvValue::Int(1)]);
        assert_eq!(sim.writes_to("LASER:SHUTTER2"), vec![PvValue::Int(0)]);
        assert_eq!(sim.value("CAM1:TIFF1:Capture"), Some(PvValue::Int(0)));
        assert!(report.grabber_aborted);
        assert!(ctx.status().console().lines().last().unwrap().ends_with(" Aborted"));
    }

    #[test]
    fn test_abort_continues_past_failures() {
        let (sim, ctx) = sim_context();
        // No PID, an unreachable device and a shutter whose control PV drops out
        sim.set("TEST:SCANPV1:PVNAME", "MOTR:GONE");
        configure_shutter(&sim, 1, 0);
        sim.set("TEST:SHUTTER1:INITIAL", 1.0);
        configure_shutter(&sim, 2, 0);
        sim.set("TEST:SHUTTER2:INITIAL", 1.0);
        sim.disconnect("LASER:SHUTTER2");

        let killer = RecordingKiller::default();
        let report = AbortController::with_killer(&ctx, &killer).abort();

        assert!(killer.killed.lock().is_empty());
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.shutters_restored, 1);
        assert_eq!(sim.writes_to("LASER:SHUTTER1"), vec![PvValue::Int(1)]);
        assert_eq!(sim.value("TEST:RUNFLAG"), Some(PvValue::Int(0)));
        assert!(ctx.status().console().lines().last().unwrap().ends_with(" Aborted"));
    }

    #[test]
    fn test_refuses_own_pid() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:PID", std::process::id() as i64);
        let killer = RecordingKiller::default();
        let report = AbortController::with_killer(&ctx, &killer).abort();
        assert!(killer.killed.lock().is_empty());
        assert_eq!(report.killed, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_killer_terminates_process() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        SignalKiller.kill(child.id() as i32).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));
    }
}
