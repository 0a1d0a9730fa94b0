//! Shared fixtures for unit tests.

use crate::config::AppConfig;
use crate::context::{Console, ScanContext, Timing};
use crate::pv::{PvValue, SimulatedPvs};
use std::sync::Arc;

/// Simulated backend plus a context with prefix `TEST`, a capturing console
/// and zero pauses.
pub(crate) fn sim_context() -> (Arc<SimulatedPvs>, ScanContext) {
    let sim = Arc::new(SimulatedPvs::new());
    let ctx = ScanContext::new("TEST", sim.clone(), &AppConfig::default(), Console::capture())
        .with_timing(Timing::immediate());
    (sim, ctx)
}

/// Make an areaDetector camera under `camera` respond like a healthy IOC:
/// acquisition follows `Acquire`, a capture finishes as soon as it starts and
/// every capture bumps the array counter and the last file name.
pub(crate) fn simulate_camera(sim: &SimulatedPvs, camera: &str, plugin: &str) {
    let cam = |field: &str| format!("{}:cam1:{}", camera, field);
    let plug = |field: &str| format!("{}:{}:{}", camera, plugin, field);

    sim.set(&cam("Acquire"), 0);
    sim.set(&cam("Acquire_RBV.RVAL"), 0);
    sim.set(&cam("ArrayCounter_RBV"), 0);
    sim.set(&cam("ImageMode"), 2);
    sim.set(&plug("Capture"), 0);
    sim.set(&plug("Capture_RBV.RVAL"), 0);
    sim.set(&plug("WriteFile_RBV.RVAL"), 0);
    sim.set(&plug("FullFileName_RBV"), "");
    sim.set(&plug("TimeStamp_RBV"), 0.0);

    let acquire_rbv = cam("Acquire_RBV.RVAL");
    let counter = cam("ArrayCounter_RBV");
    sim.on_put(&cam("Acquire"), move |value, values| {
        values.insert(acquire_rbv.clone(), value.clone());
        if value.is_truthy() {
            let next = values.get(&counter).and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            values.insert(counter.clone(), PvValue::Int(next));
        }
    });

    let capture_rbv = plug("Capture_RBV.RVAL");
    let last_file = plug("FullFileName_RBV");
    let counter = cam("ArrayCounter_RBV");
    let camera = camera.to_string();
    sim.on_put(&plug("Capture"), move |value, values| {
        values.insert(capture_rbv.clone(), PvValue::Int(0));
        if value.is_truthy() {
            let next = values.get(&counter).and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            values.insert(counter.clone(), PvValue::Int(next));
            values.insert(
                last_file.clone(),
                PvValue::Str(format!("/tmp/{}_{:04}.tif", camera, next)),
            );
        }
    });
}

/// Fill `SCANPV<slot>:*` for a generic PV scanned from `start` to `stop`,
/// and create the PV itself at `initial`.
pub(crate) fn configure_device(
    sim: &SimulatedPvs,
    slot: usize,
    name: &str,
    range: (f64, f64, i64),
    initial: f64,
) {
    let key = |field: &str| format!("TEST:SCANPV{}:{}", slot, field);
    sim.set(&key("PVNAME"), name);
    sim.set(&key("PVTYPE"), 0);
    sim.set(&key("START"), range.0);
    sim.set(&key("STOP"), range.1);
    sim.set(&key("NSTEPS"), range.2);
    sim.set(&key("DESC"), format!("axis{}", slot));
    sim.set(name, initial);
}

/// Configure shutter `number` as an enabled single-PV shutter whose readback
/// follows its control PV.
pub(crate) fn configure_shutter(sim: &SimulatedPvs, number: usize, initial: i64) {
    let control = format!("LASER:SHUTTER{}", number);
    let readback = format!("LASER:SHUTTER{}:RBV", number);
    let key = |field: &str| format!("TEST:SHUTTER{}:{}", number, field);
    sim.set(&key("PVNAME"), control.as_str());
    sim.set(&key("TYPE"), 1);
    sim.set(&key("ENABLE"), 1);
    sim.set(&key("RBV"), readback.as_str());
    sim.set(&control, initial);
    sim.set(&readback, initial);
    sim.link(&control, &readback);
}
