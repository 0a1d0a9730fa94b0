//! Optical shutters and shutter groups.
//!
//! Shutter kinds are selected by `SHUTTERn:TYPE`. All commands on a shutter
//! whose `SHUTTERn:ENABLE` flag is clear are skipped without touching
//! hardware.

use crate::context::{ScanContext, StatusChannel, Timing};
use crate::error::ScanError;
use crate::pv::Pv;
use crate::utils::pause;
use log::{debug, error, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterKind {
    /// Plain binary output driving all commands
    Dummy,
    /// Sutter Lambda SC controller
    LambdaSc,
    /// Thorlabs SC10 controller
    ThorlabsSc,
}

impl ShutterKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ShutterKind::Dummy),
            2 => Some(ShutterKind::LambdaSc),
            3 => Some(ShutterKind::ThorlabsSc),
            _ => None,
        }
    }
}

/// Command and status PV names for one shutter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutterNames {
    pub status: String,
    pub open: String,
    pub close: String,
    pub ttl_enable: String,
    pub ttl_disable: String,
    pub soft: Option<String>,
    pub fast: Option<String>,
    pub trigger_out_mode: Option<String>,
    pub output_mode: Option<String>,
}

/// Derive command PVs from the control PV name.
pub fn derive_shutter_names(kind: ShutterKind, control: &str) -> ShutterNames {
    let root = control.split(':').take(2).collect::<Vec<_>>().join(":");
    let at = |suffix: &str| format!("{}:{}", root, suffix);

    match kind {
        ShutterKind::Dummy => ShutterNames {
            status: control.to_string(),
            open: control.to_string(),
            close: control.to_string(),
            ttl_enable: control.to_string(),
            ttl_disable: control.to_string(),
            soft: Some(control.to_string()),
            fast: Some(control.to_string()),
            trigger_out_mode: None,
            output_mode: None,
        },
        ShutterKind::LambdaSc => ShutterNames {
            status: at("STATUS:OC"),
            open: at("OC:OPEN"),
            close: at("OC:CLOSE"),
            ttl_enable: at("TTL:IN:HIGH"),
            ttl_disable: at("TTL:IN:DISABLE"),
            soft: Some(at("MODE:SOFT")),
            fast: Some(at("MODE:FAST")),
            trigger_out_mode: None,
            output_mode: None,
        },
        ShutterKind::ThorlabsSc => ShutterNames {
            status: at("SHUTTER:STATE_RBV"),
            open: at("SHUTTER:OPEN"),
            close: at("SHUTTER:CLOSE"),
            ttl_enable: at("TRIG:IN_MODE"),
            ttl_disable: at("TRIG:IN_MODE"),
            soft: None,
            fast: None,
            trigger_out_mode: Some(at("TRIG:OUT_MODE")),
            output_mode: Some(at("SHUTTER:OUT_MODE")),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterState {
    Open,
    Closed,
}

impl ShutterState {
    /// Status value 1 means open; anything else, including an unreadable
    /// status, is treated as closed.
    pub fn from_status(value: Option<f64>) -> Self {
        match value {
            Some(v) if v == 1.0 => ShutterState::Open,
            _ => ShutterState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shutter {
    number: usize,
    kind: ShutterKind,
    enabled: bool,
    names: ShutterNames,
    control: Pv,
    status: Pv,
    open: Pv,
    close: Pv,
    ttl_enable: Pv,
    ttl_disable: Pv,
    soft: Option<Pv>,
    fast: Option<Pv>,
    readback: Option<Pv>,
    initial: Pv,
    channel: StatusChannel,
    timing: Timing,
}

impl Shutter {
    pub fn new(
        ctx: &ScanContext,
        number: usize,
        kind: ShutterKind,
        control: &str,
        readback: Option<&str>,
        enabled: bool,
    ) -> Self {
        let names = derive_shutter_names(kind, control);
        let opt = |name: &Option<String>| name.as_deref().map(|n| ctx.pv(n));
        Self {
            number,
            kind,
            enabled,
            control: ctx.pv(control),
            status: ctx.pv(&names.status),
            open: ctx.pv(&names.open),
            close: ctx.pv(&names.close),
            ttl_enable: ctx.pv(&names.ttl_enable),
            ttl_disable: ctx.pv(&names.ttl_disable),
            soft: opt(&names.soft),
            fast: opt(&names.fast),
            readback: readback
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(|r| ctx.pv(r)),
            initial: ctx.config_pv(&format!("SHUTTER{}:INITIAL", number)),
            channel: ctx.status().clone(),
            timing: ctx.timing().clone(),
            names,
        }
    }

    /// Build shutter `number` (1-based) from the configuration namespace.
    ///
    /// Returns `None` for an empty slot or an unknown shutter type.
    pub fn from_config(ctx: &ScanContext, number: usize) -> Result<Option<Self>, ScanError> {
        let key = |field: &str| format!("SHUTTER{}:{}", number, field);
        let control = ctx.string(&key("PVNAME"));
        if control.is_empty() {
            return Ok(None);
        }
        if !ctx.pv(&control).connected() {
            error!("Invalid shutter PV: {}", control);
            return Err(ScanError::InvalidPv(control));
        }

        let code = ctx.i64_or(&key("TYPE"), 0);
        let Some(kind) = ShutterKind::from_code(code) else {
            warn!("Shutter {}: unknown shutter type {}", number, code);
            return Ok(None);
        };

        let readback = ctx.string(&key("RBV"));
        let enabled = ctx.flag(&key("ENABLE"));
        Ok(Some(Self::new(
            ctx,
            number,
            kind,
            &control,
            Some(&readback),
            enabled,
        )))
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn kind(&self) -> ShutterKind {
        self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn names(&self) -> &ShutterNames {
        &self.names
    }

    pub fn control(&self) -> &Pv {
        &self.control
    }

    pub fn readback(&self) -> Option<&Pv> {
        self.readback.as_ref()
    }

    /// Whether the configured readback PV currently yields a value.
    pub fn has_valid_readback(&self) -> bool {
        self.readback
            .as_ref()
            .and_then(|rbv| rbv.get_f64())
            .is_some()
    }

    pub fn state(&self) -> ShutterState {
        ShutterState::from_status(self.status.get_f64())
    }

    fn command(&self, pv: &Pv, value: i64) -> Result<(), ScanError> {
        if !self.enabled {
            debug!("Shutter {} disabled, skipping {}", self.number, pv.name());
            return Ok(());
        }
        pv.put(value)
    }

    pub fn open(&self) -> Result<(), ScanError> {
        self.command(&self.open, 1)
    }

    pub fn close(&self) -> Result<(), ScanError> {
        self.command(&self.close, 0)
    }

    pub fn ttl_in_enable(&self) -> Result<(), ScanError> {
        self.command(&self.ttl_enable, 1)
    }

    pub fn ttl_in_disable(&self) -> Result<(), ScanError> {
        self.command(&self.ttl_disable, 1)
    }

    pub fn soft(&self) -> Result<(), ScanError> {
        match &self.soft {
            Some(pv) => self.command(pv, 1),
            None => {
                debug!("Shutter {} has no soft mode", self.number);
                Ok(())
            }
        }
    }

    pub fn fast(&self) -> Result<(), ScanError> {
        match &self.fast {
            Some(pv) => self.command(pv, 1),
            None => {
                debug!("Shutter {} has no fast mode", self.number);
                Ok(())
            }
        }
    }

    /// Drive the shutter to `state`.
    pub fn restore(&self, state: ShutterState) -> Result<(), ScanError> {
        match state {
            ShutterState::Open => self.open(),
            ShutterState::Closed => self.close(),
        }
    }

    /// Store the current status in `SHUTTERn:INITIAL` for the abort path.
    pub fn record_initial(&self) -> Result<(), ScanError> {
        match self.status.get_f64() {
            Some(value) => {
                self.initial.put(value)?;
                debug!("Shutter {} initial state: {}", self.number, value);
                Ok(())
            }
            None => {
                warn!(
                    "Shutter {}: status {} unreadable, initial state not recorded",
                    self.number,
                    self.status.name()
                );
                Ok(())
            }
        }
    }

    pub fn initial_state(&self) -> Option<ShutterState> {
        self.initial
            .get_f64()
            .map(|v| ShutterState::from_status(Some(v)))
    }

    pub fn open_check(&self, threshold: f64) -> Result<(), ScanError> {
        self.check(threshold, ShutterState::Open)
    }

    pub fn close_check(&self, threshold: f64) -> Result<(), ScanError> {
        self.check(threshold, ShutterState::Closed)
    }

    fn check(&self, threshold: f64, expected: ShutterState) -> Result<(), ScanError> {
        if !self.enabled {
            return Ok(());
        }
        pause(self.timing.shutter_check);

        let Some(value) = self.readback.as_ref().and_then(|rbv| rbv.get_f64()) else {
            let msg = format!("Failed shutter check: shutter {} RBV invalid", self.number);
            self.channel.print_msg(&msg);
            return Err(ScanError::Shutter(msg));
        };

        let mismatch = match expected {
            ShutterState::Open => value < threshold,
            ShutterState::Closed => value > threshold,
        };
        if mismatch {
            let msg = format!("Failed shutter check: shutter {}", self.number);
            self.channel.print_msg(&msg);
            return Err(ScanError::Shutter(msg));
        }
        Ok(())
    }
}

/// Fan-out operations over a set of shutters.
///
/// Commands are best effort: every enabled member is attempted and a
/// failure does not roll back members already switched. The returned error
/// names every member that failed. Checks stop at the first mismatch.
#[derive(Debug, Clone, Default)]
pub struct ShutterGroup {
    members: Vec<Arc<Shutter>>,
}

impl ShutterGroup {
    pub fn new(members: Vec<Arc<Shutter>>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[Arc<Shutter>] {
        &self.members
    }

    pub fn readbacks(&self) -> Vec<Option<Pv>> {
        self.members.iter().map(|s| s.readback().cloned()).collect()
    }

    fn fan_out<F>(&self, describe: &str, op: F) -> Result<(), ScanError>
    where
        F: Fn(&Shutter) -> Result<(), ScanError>,
    {
        let mut failed = Vec::new();
        for shutter in self.members.iter().filter(|s| s.enabled()) {
            shutter
                .channel
                .print_msg(&describe.replace("{}", &shutter.number().to_string()));
            if let Err(e) = op(shutter.as_ref()) {
                error!("Shutter {}: {}", shutter.number(), e);
                failed.push(shutter.number().to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ScanError::Shutter(format!(
                "command failed for shutter(s) {}",
                failed.join(", ")
            )))
        }
    }

    pub fn open(&self) -> Result<(), ScanError> {
        self.fan_out("Opening shutter {}", Shutter::open)
    }

    pub fn close(&self) -> Result<(), ScanError> {
        self.fan_out("Closing shutter {}", Shutter::close)
    }

    pub fn soft(&self) -> Result<(), ScanError> {
        self.fan_out("Setting shutter {} to Soft mode", Shutter::soft)
    }

    pub fn fast(&self) -> Result<(), ScanError> {
        self.fan_out("Setting shutter {} to Fast mode", Shutter::fast)
    }

    pub fn ttl_in_enable(&self) -> Result<(), ScanError> {
        self.fan_out("Setting shutter {} to TTL In Enable", Shutter::ttl_in_enable)
    }

    pub fn ttl_in_disable(&self) -> Result<(), ScanError> {
        self.fan_out("Setting shutter {} to TTL In Disable", Shutter::ttl_in_disable)
    }

    pub fn open_check(&self, threshold: f64) -> Result<(), ScanError> {
        self.members
            .iter()
            .try_for_each(|s| s.open_check(threshold))
    }

    pub fn close_check(&self, threshold: f64) -> Result<(), ScanError> {
        self.members
            .iter()
            .try_for_each(|s| s.close_check(threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::PvValue;
    use crate::testing::sim_context;

    #[test]
    fn test_lambda_and_thorlabs_names() {
        let lsc = derive_shutter_names(ShutterKind::LambdaSc, "ESB:LSC01:OC:OPEN");
        assert_eq!(lsc.status, "ESB:LSC01:STATUS:OC");
        assert_eq!(lsc.close, "ESB:LSC01:OC:CLOSE");
        assert_eq!(lsc.soft.as_deref(), Some("ESB:LSC01:MODE:SOFT"));

        let thor = derive_shutter_names(ShutterKind::ThorlabsSc, "ESB:SC10:SHUTTER:OPEN");
        assert_eq!(thor.status, "ESB:SC10:SHUTTER:STATE_RBV");
        assert_eq!(thor.ttl_enable, thor.ttl_disable);
        assert_eq!(thor.soft, None);
        assert_eq!(thor.output_mode.as_deref(), Some("ESB:SC10:SHUTTER:OUT_MODE"));
    }

    #[test]
    fn test_dummy_open_close_values() {
        let (sim, ctx) = sim_context();
        let shutter = Shutter::new(&ctx, 1, ShutterKind::Dummy, "ESB:GP01:VAL01", None, true);
        shutter.open().unwrap();
        shutter.close().unwrap();
        assert_eq!(
            sim.writes_to("ESB:GP01:VAL01"),
            vec![PvValue::Int(1), PvValue::Int(0)]
        );
        assert_eq!(shutter.state(), ShutterState::Closed);
    }

    #[test]
    fn test_group_close_skips_disabled_members() {
        let (sim, ctx) = sim_context();
        let group = ShutterGroup::new(vec![
            Arc::new(Shutter::new(&ctx, 1, ShutterKind::Dummy, "SH:1", None, true)),
            Arc::new(Shutter::new(&ctx, 2, ShutterKind::Dummy, "SH:2", None, false)),
            Arc::new(Shutter::new(&ctx, 3, ShutterKind::LambdaSc, "LSC:3:X", None, true)),
        ]);

        group.close().unwrap();
        assert_eq!(sim.writes_to("SH:1"), vec![PvValue::Int(0)]);
        assert!(sim.writes_to("SH:2").is_empty());
        assert_eq!(sim.writes_to("LSC:3:OC:CLOSE"), vec![PvValue::Int(0)]);

        let lines = ctx.status().console().lines();
        assert!(lines.iter().any(|l| l.ends_with("Closing shutter 1")));
        assert!(!lines.iter().any(|l| l.ends_with("Closing shutter 2")));
    }

    #[test]
    fn test_group_is_best_effort() {
        let (sim, ctx) = sim_context();
        sim.set("SH:1", 0);
        sim.disconnect("SH:1");
        let group = ShutterGroup::new(vec![
            Arc::new(Shutter::new(&ctx, 1, ShutterKind::Dummy, "SH:1", None, true)),
            Arc::new(Shutter::new(&ctx, 2, ShutterKind::Dummy, "SH:2", None, true)),
        ]);

        let err = group.open().unwrap_err();
        assert!(err.to_string().contains("shutter(s) 1"));
        assert_eq!(sim.writes_to("SH:2"), vec![PvValue::Int(1)]);
    }

    #[test]
    fn test_checks() {
        let (sim, ctx) = sim_context();
        let shutter = Shutter::new(&ctx, 2, ShutterKind::Dummy, "SH:2", Some("SH:2:RBV"), true);

        let err = shutter.open_check(0.5).unwrap_err();
        assert_eq!(err.to_string(), "Shutter Error: Failed shutter check: shutter 2 RBV invalid");

        sim.set("SH:2:RBV", 1.0);
        assert!(shutter.open_check(0.5).is_ok());
        assert!(shutter.close_check(0.5).is_err());

        sim.set("SH:2:RBV", 0.0);
        assert!(shutter.close_check(0.5).is_ok());
        let err = shutter.open_check(0.5).unwrap_err();
        assert_eq!(err.to_string(), "Shutter Error: Failed shutter check: shutter 2");
    }

    #[test]
    fn test_initial_state_roundtrip() {
        let (sim, ctx) = sim_context();
        sim.set("SH:1", 1);
        let shutter = Shutter::new(&ctx, 1, ShutterKind::Dummy, "SH:1", None, true);
        shutter.record_initial().unwrap();
        assert_eq!(sim.value("TEST:SHUTTER1:INITIAL"), Some(PvValue::Double(1.0)));
        assert_eq!(shutter.initial_state(), Some(ShutterState::Open));
    }

    #[test]
    fn test_from_config() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:SHUTTER1:PVNAME", "ESB:GP01:VAL01");
        sim.set("TEST:SHUTTER1:TYPE", 1);
        sim.set("TEST:SHUTTER1:ENABLE", 1);
        sim.set("TEST:SHUTTER1:RBV", "ESB:GP01:VAL01");
        sim.set("ESB:GP01:VAL01", 0);

        let shutter = Shutter::from_config(&ctx, 1).unwrap().unwrap();
        assert!(shutter.enabled());
        assert!(shutter.has_valid_readback());

        sim.set("TEST:SHUTTER2:PVNAME", "ESB:GP01:VAL02");
        sim.set("ESB:GP01:VAL02", 0);
        sim.set("TEST:SHUTTER2:TYPE", 9);
        assert!(Shutter::from_config(&ctx, 2).unwrap().is_none());
        assert!(Shutter::from_config(&ctx, 3).unwrap().is_none());
    }
}
