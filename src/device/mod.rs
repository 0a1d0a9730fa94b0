//! Scannable devices.
//!
//! A device is one of a fixed set of kinds selected by `SCANPVn:PVTYPE`.
//! Kinds differ only in how companion PV names are derived
//! ([`naming::derive_names`]) and in whether a move needs an explicit go
//! trigger; everything else goes through [`Movable`] and [`SettlePollable`].

pub mod naming;
pub mod positions;

pub use naming::{derive_names, DeviceNames};
pub use positions::{
    checked_step_count, frange, linear_positions, parse_position_list, shuffled_positions,
    MAX_STEPS,
};

use crate::context::{ScanContext, Timing};
use crate::error::ScanError;
use crate::pv::Pv;
use crate::utils::{pause, poll_until, secs, PollError};
use log::{debug, warn};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Generic,
    Motor,
    PolluxMotor,
    BeckhoffMotor,
    Magnet,
    Lakeshore,
    Readback,
}

impl DeviceKind {
    /// Kind for a `PVTYPE` code; unknown codes fall back to a generic PV.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => DeviceKind::Motor,
            2 => DeviceKind::PolluxMotor,
            3 => DeviceKind::BeckhoffMotor,
            4 => DeviceKind::Magnet,
            5 => DeviceKind::Lakeshore,
            6 => DeviceKind::Readback,
            _ => DeviceKind::Generic,
        }
    }

    pub fn default_tolerance(self) -> f64 {
        match self {
            DeviceKind::Lakeshore => 0.2,
            DeviceKind::Readback => 0.1,
            _ => 0.005,
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            DeviceKind::Generic | DeviceKind::Magnet => Duration::from_secs(300),
            DeviceKind::Lakeshore => Duration::from_secs(600),
            DeviceKind::Motor
            | DeviceKind::PolluxMotor
            | DeviceKind::BeckhoffMotor
            | DeviceKind::Readback => Duration::from_secs(360),
        }
    }

    /// Kinds whose setpoint write must be followed by a go command.
    pub fn uses_go_trigger(self) -> bool {
        matches!(self, DeviceKind::PolluxMotor | DeviceKind::BeckhoffMotor)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceKind::Generic => "PV",
            DeviceKind::Motor => "Motor",
            DeviceKind::PolluxMotor => "Pollux motor",
            DeviceKind::BeckhoffMotor => "Beckhoff motor",
            DeviceKind::Magnet => "Magnet",
            DeviceKind::Lakeshore => "Lakeshore",
            DeviceKind::Readback => "PV with RBV",
        };
        write!(f, "{}", label)
    }
}

/// How a settle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Settled,
    /// Bound reached; the scan proceeds anyway
    TimedOut,
    /// Readback missing or unreadable; the full timeout was slept
    ReadbackInvalid,
    /// No wait requested
    Skipped,
}

pub trait Movable {
    /// Setpoint PV name, as shown in status messages.
    fn name(&self) -> &str;

    /// Current setpoint value.
    fn position(&self) -> Option<f64>;

    /// Write `target` (with go trigger where needed), then wait for the
    /// readback if the device has one.
    fn move_to(&self, target: f64) -> Result<Settle, ScanError>;
}

pub trait SettlePollable {
    fn wait_until_settled(&self, target: f64, tolerance: f64, timeout: Duration) -> Settle;
}

/// PV handles of a device, without any scan parameters.
///
/// This is all the abort path needs, so it can be built even when the scan
/// parameters are incomplete.
#[derive(Debug, Clone)]
pub struct DeviceHandles {
    pub kind: DeviceKind,
    pub names: DeviceNames,
    pub setpoint: Pv,
    pub readback: Option<Pv>,
    pub go: Option<Pv>,
    pub abort: Option<Pv>,
    pub velocity: Option<Pv>,
}

impl DeviceHandles {
    pub fn new(
        ctx: &ScanContext,
        kind: DeviceKind,
        base: &str,
        explicit_readback: Option<&str>,
    ) -> Result<Self, ScanError> {
        let base = base.trim();
        if base.is_empty() {
            ctx.status().fail("Invalid PV");
            return Err(ScanError::InvalidPv("empty PV name".to_string()));
        }

        let names = derive_names(kind, base, explicit_readback);
        if kind == DeviceKind::Readback {
            let valid = names
                .readback
                .as_deref()
                .map(|rbv| ctx.pv(rbv).connected())
                .unwrap_or(false);
            if !valid {
                let rbv = names.readback.clone().unwrap_or_default();
                ctx.status().fail(&format!("RBV {} invalid", rbv));
                return Err(ScanError::InvalidPv(format!("RBV {} invalid", rbv)));
            }
        }

        let handle = |name: &Option<String>| name.as_deref().map(|n| ctx.pv(n));
        Ok(Self {
            kind,
            setpoint: ctx.pv(&names.setpoint),
            readback: handle(&names.readback),
            go: handle(&names.go),
            abort: handle(&names.abort),
            velocity: handle(&names.velocity),
            names,
        })
    }

    /// Handles for configuration slot `slot` (1-based), or `None` when the
    /// slot has no PV name.
    pub fn from_config(ctx: &ScanContext, slot: usize) -> Result<Option<Self>, ScanError> {
        let key = |field: &str| format!("SCANPV{}:{}", slot, field);
        let base = ctx.string(&key("PVNAME"));
        if base.is_empty() {
            return Ok(None);
        }
        if !ctx.pv(&base).connected() {
            ctx.status().fail(&format!("Invalid PV: {}", base));
            return Err(ScanError::InvalidPv(base));
        }

        let kind = DeviceKind::from_code(ctx.i64_or(&key("PVTYPE"), 0));
        let explicit_readback = ctx.string(&key("RBVNAME"));
        Self::new(ctx, kind, &base, Some(&explicit_readback)).map(Some)
    }

    /// Send the stop command. Returns `false` when the kind has no stop PV.
    pub fn stop(&self) -> Result<bool, ScanError> {
        match &self.abort {
            Some(abort) => {
                abort.put(1)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Inclusive sub-range swept before the main scan.
#[derive(Debug, Clone, PartialEq)]
pub struct PreScanRange {
    pub start: f64,
    pub stop: f64,
    pub step_count: usize,
}

impl PreScanRange {
    pub fn positions(&self) -> Result<Vec<f64>, ScanError> {
        linear_positions(self.start, self.stop, self.step_count)
    }
}

#[derive(Debug, Clone)]
pub struct ScanParams {
    pub description: String,
    pub start: f64,
    pub stop: f64,
    pub step_count: usize,
    pub settle_time: Duration,
    pub tolerance: f64,
    pub timeout: Duration,
    pub random: bool,
    pub pre_scan: Option<PreScanRange>,
}

/// A device together with its scan parameters and position sequence.
#[derive(Debug, Clone)]
pub struct ScanDevice {
    slot: usize,
    handles: DeviceHandles,
    params: ScanParams,
    positions: Vec<f64>,
    step_count_pv: Option<Pv>,
    timing: Timing,
}

impl ScanDevice {
    /// Build slot `slot` from the configuration namespace.
    ///
    /// Publishes the device PV names into the `VAL.INP`/`RBV.INP` links so
    /// the operator panel follows the scanned PV.
    pub fn from_config(ctx: &ScanContext, slot: usize) -> Result<Option<Self>, ScanError> {
        let Some(handles) = DeviceHandles::from_config(ctx, slot)? else {
            return Ok(None);
        };
        let key = |field: &str| format!("SCANPV{}:{}", slot, field);

        ctx.config_pv(&key("VAL.INP"))
            .put_str(&format!("{} CPP", handles.names.setpoint))?;
        if let Some(rbv) = &handles.names.readback {
            ctx.config_pv(&key("RBV.INP"))
                .put_str(&format!("{} CPP", rbv))?;
        }

        let random = ctx.flag(&key("RANDSCAN"));
        let start = ctx.require_f64(&key("START"))?;
        let stop = ctx.require_f64(&key("STOP"))?;
        let step_count = if random {
            ctx.i64_or(&key("NSTEPS"), 0).max(0) as usize
        } else {
            let n = ctx.require_f64(&key("NSTEPS"))?;
            checked_step_count(n, &format!("{}:{}", ctx.prefix(), key("NSTEPS")))?
        };

        let positions = if random {
            shuffled_positions(&ctx.string(&key("RAND_VALS")))?
        } else {
            linear_positions(start, stop, step_count)?
        };
        debug!("{}: positions {:?}", handles.names.setpoint, positions);

        let delta = ctx.f64_or(&key("DELTA"), 0.0);
        let tolerance = if delta != 0.0 {
            delta
        } else {
            handles.kind.default_tolerance()
        };

        let pre_scan = match (
            ctx.config_pv(&key("PRE_START")).get_f64(),
            ctx.config_pv(&key("PRE_STOP")).get_f64(),
            ctx.config_pv(&key("PRE_NSTEPS")).get_f64(),
        ) {
            (Some(start), Some(stop), Some(n)) => Some(PreScanRange {
                start,
                stop,
                step_count: checked_step_count(
                    n,
                    &format!("{}:{}", ctx.prefix(), key("PRE_NSTEPS")),
                )?,
            }),
            _ => None,
        };

        let params = ScanParams {
            description: ctx.string(&key("DESC")).replace(' ', "_"),
            start,
            stop,
            step_count,
            settle_time: secs(ctx.f64_or(&key("SETTLETIME"), 0.0)),
            tolerance,
            timeout: ctx
                .timing()
                .settle_override
                .unwrap_or_else(|| handles.kind.default_timeout()),
            random,
            pre_scan,
        };

        Ok(Some(Self {
            slot,
            handles,
            params,
            positions,
            step_count_pv: Some(ctx.config_pv(&key("STEPCOUNT"))),
            timing: ctx.timing().clone(),
        }))
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn kind(&self) -> DeviceKind {
        self.handles.kind
    }

    pub fn handles(&self) -> &DeviceHandles {
        &self.handles
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn description(&self) -> &str {
        &self.params.description
    }

    pub fn publish_step(&self, step: usize) -> Result<(), ScanError> {
        match &self.step_count_pv {
            Some(pv) => pv.put(step as i64),
            None => Ok(()),
        }
    }

    /// Move with an explicit wait choice.
    pub fn move_with(&self, target: f64, wait: bool) -> Result<Settle, ScanError> {
        self.handles.setpoint.put(target)?;
        if self.handles.kind.uses_go_trigger() {
            pause(self.timing.go_trigger);
            if let Some(go) = &self.handles.go {
                go.put(1)?;
            }
        }
        if !wait {
            return Ok(Settle::Skipped);
        }
        Ok(self.wait_until_settled(target, self.params.tolerance, self.params.timeout))
    }
}

impl Movable for ScanDevice {
    fn name(&self) -> &str {
        &self.handles.names.setpoint
    }

    fn position(&self) -> Option<f64> {
        self.handles.setpoint.get_f64()
    }

    fn move_to(&self, target: f64) -> Result<Settle, ScanError> {
        let wait = self.handles.readback.is_some() || self.handles.kind != DeviceKind::Generic;
        self.move_with(target, wait)
    }
}

impl SettlePollable for ScanDevice {
    fn wait_until_settled(&self, target: f64, tolerance: f64, timeout: Duration) -> Settle {
        let Some(readback) = &self.handles.readback else {
            warn!(
                "RBV is invalid for {}, pausing for {:.3} seconds",
                self.name(),
                timeout.as_secs_f64()
            );
            pause(timeout);
            return Settle::ReadbackInvalid;
        };

        let result = poll_until(
            || match readback.get_f64() {
                Some(value) => Ok(value == target || (value - target).abs() <= tolerance),
                None => Err(()),
            },
            timeout,
            self.timing.settle_poll,
        );

        match result {
            Ok(()) => Settle::Settled,
            Err(PollError::Timeout) => {
                warn!(
                    "{} did not reach {} within {:.3} s (readback {:?}), continuing",
                    self.name(),
                    target,
                    timeout.as_secs_f64(),
                    readback.get_f64()
                );
                Settle::TimedOut
            }
            Err(PollError::ConditionError(())) => {
                warn!(
                    "RBV is invalid for {}, pausing for {:.3} seconds",
                    self.name(),
                    timeout.as_secs_f64()
                );
                pause(timeout);
                Settle::ReadbackInvalid
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sim_context;

    fn configure_slot(sim: &crate::pv::SimulatedPvs, slot: usize, name: &str, kind: i64) {
        let key = |f: &str| format!("TEST:SCANPV{}:{}", slot, f);
        sim.set(&key("PVNAME"), name);
        sim.set(&key("PVTYPE"), kind);
        sim.set(&key("START"), 0.0);
        sim.set(&key("STOP"), 1.0);
        sim.set(&key("NSTEPS"), 3);
        sim.set(&key("DESC"), "stage x");
    }

    #[test]
    fn test_kind_codes_and_defaults() {
        assert_eq!(DeviceKind::from_code(1), DeviceKind::Motor);
        assert_eq!(DeviceKind::from_code(6), DeviceKind::Readback);
        assert_eq!(DeviceKind::from_code(42), DeviceKind::Generic);
        assert_eq!(DeviceKind::Lakeshore.default_tolerance(), 0.2);
        assert_eq!(DeviceKind::Lakeshore.default_timeout(), Duration::from_secs(600));
        assert_eq!(DeviceKind::Magnet.default_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_empty_slot_is_none() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:SCANPV1:PVNAME", "");
        assert!(ScanDevice::from_config(&ctx, 1).unwrap().is_none());
        assert!(ScanDevice::from_config(&ctx, 2).unwrap().is_none());
    }

    #[test]
    fn test_unreachable_pv_is_config_error() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "MOTR:X", 1);
        assert!(matches!(
            ScanDevice::from_config(&ctx, 1),
            Err(ScanError::InvalidPv(_))
        ));
    }

    #[test]
    fn test_motor_from_config_publishes_links() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "MOTR:X", 1);
        sim.set("MOTR:X", 0.0);
        sim.set("TEST:SCANPV1:DELTA", 0.01);

        let device = ScanDevice::from_config(&ctx, 1).unwrap().unwrap();
        assert_eq!(device.kind(), DeviceKind::Motor);
        assert_eq!(device.positions(), &[0.0, 0.5, 1.0]);
        assert_eq!(device.description(), "stage_x");
        assert_eq!(device.params().tolerance, 0.01);
        assert_eq!(
            sim.value("TEST:SCANPV1:VAL.INP").unwrap().as_string(),
            "MOTR:X CPP"
        );
        assert_eq!(
            sim.value("TEST:SCANPV1:RBV.INP").unwrap().as_string(),
            "MOTR:X.RBV CPP"
        );
    }

    #[test]
    fn test_single_step_rejected() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "PHASE:SET", 0);
        sim.set("PHASE:SET", 0.0);
        sim.set("TEST:SCANPV1:NSTEPS", 1);
        assert!(matches!(
            ScanDevice::from_config(&ctx, 1),
            Err(ScanError::Config(_))
        ));
    }

    #[test]
    fn test_fractional_or_huge_step_count_rejected() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "PHASE:SET", 0);
        sim.set("PHASE:SET", 0.0);
        sim.set("TEST:SCANPV1:NSTEPS", 2.9);
        match ScanDevice::from_config(&ctx, 1) {
            Err(ScanError::Config(msg)) => assert!(msg.contains("TEST:SCANPV1:NSTEPS")),
            other => panic!("unexpected: {:?}", other.map(|d| d.is_some())),
        }

        sim.set("TEST:SCANPV1:NSTEPS", 1e12);
        assert!(matches!(
            ScanDevice::from_config(&ctx, 1),
            Err(ScanError::Config(_))
        ));

        sim.set("TEST:SCANPV1:NSTEPS", 3);
        sim.set("TEST:SCANPV1:PRE_START", 0.0);
        sim.set("TEST:SCANPV1:PRE_STOP", 1.0);
        sim.set("TEST:SCANPV1:PRE_NSTEPS", 4.5);
        assert!(matches!(
            ScanDevice::from_config(&ctx, 1),
            Err(ScanError::Config(_))
        ));
    }

    #[test]
    fn test_readback_kind_requires_valid_rbv() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "PHASE:SET", 6);
        sim.set("PHASE:SET", 0.0);
        sim.set("TEST:SCANPV1:RBVNAME", "PHASE:ACT");
        assert!(ScanDevice::from_config(&ctx, 1).is_err());

        sim.set("PHASE:ACT", 0.0);
        let device = ScanDevice::from_config(&ctx, 1).unwrap().unwrap();
        assert_eq!(device.handles().names.readback.as_deref(), Some("PHASE:ACT"));
    }

    #[test]
    fn test_go_trigger_sequence() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "ESB:XPS1:AO:ABSMOV", 2);
        sim.set("ESB:XPS1:AO:ABSMOV", 0.0);
        sim.set("ESB:XPS1:AI:ACTPOS", 0.0);
        sim.link("ESB:XPS1:AO:ABSMOV", "ESB:XPS1:AI:ACTPOS");

        let device = ScanDevice::from_config(&ctx, 1).unwrap().unwrap();
        sim.clear_writes();
        assert_eq!(device.move_to(0.5).unwrap(), Settle::Settled);

        let names: Vec<String> = sim.writes().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["ESB:XPS1:AO:ABSMOV", "ESB:XPS1:BO:GOABS"]);
    }

    #[test]
    fn test_settle_within_tolerance_and_timeout() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "MOTR:X", 1);
        sim.set("MOTR:X", 0.0);
        sim.set("MOTR:X.RBV", 0.0);
        let device = ScanDevice::from_config(&ctx, 1).unwrap().unwrap();

        sim.set("MOTR:X.RBV", 0.498);
        assert_eq!(
            device.wait_until_settled(0.5, 0.005, Duration::from_millis(10)),
            Settle::Settled
        );
        sim.set("MOTR:X.RBV", 0.3);
        assert_eq!(
            device.wait_until_settled(0.5, 0.005, Duration::from_millis(10)),
            Settle::TimedOut
        );
        sim.disconnect("MOTR:X.RBV");
        assert_eq!(
            device.wait_until_settled(0.5, 0.005, Duration::from_millis(5)),
            Settle::ReadbackInvalid
        );
    }

    #[test]
    fn test_generic_device_does_not_wait() {
        let (sim, ctx) = sim_context();
        configure_slot(&sim, 1, "PHASE:SET", 0);
        sim.set("PHASE:SET", 0.0);
        let device = ScanDevice::from_config(&ctx, 1).unwrap().unwrap();
        assert_eq!(device.move_to(1.0).unwrap(), Settle::Skipped);
        assert_eq!(device.position(), Some(1.0));
    }

    #[test]
    fn test_stop_uses_abort_pv() {
        let (sim, ctx) = sim_context();
        let motor = DeviceHandles::new(&ctx, DeviceKind::Motor, "MOTR:X", None).unwrap();
        assert!(motor.stop().unwrap());
        assert_eq!(sim.writes_to("MOTR:X.STOP").len(), 1);

        let generic = DeviceHandles::new(&ctx, DeviceKind::Generic, "PHASE:SET", None).unwrap();
        assert!(!generic.stop().unwrap());
    }
}
