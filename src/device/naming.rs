//! Companion PV name derivation.
//!
//! Each device kind knows how to find its readback, go, stop and velocity
//! records from the base name an operator typed in. These are pure string
//! functions so the conventions can be checked without a control system.

use super::DeviceKind;

/// PV names used by one scannable device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceNames {
    pub setpoint: String,
    pub readback: Option<String>,
    pub go: Option<String>,
    pub abort: Option<String>,
    pub velocity: Option<String>,
}

/// Derive companion names for `kind` from `base`.
///
/// `explicit_readback` is only consulted for [`DeviceKind::Readback`],
/// whose readback cannot be derived from the setpoint name.
pub fn derive_names(kind: DeviceKind, base: &str, explicit_readback: Option<&str>) -> DeviceNames {
    match kind {
        DeviceKind::Generic => generic(base),
        DeviceKind::Motor => motor(base),
        DeviceKind::PolluxMotor => pollux(base),
        DeviceKind::BeckhoffMotor => beckhoff(base),
        DeviceKind::Magnet => magnet(base),
        DeviceKind::Lakeshore => lakeshore(base),
        DeviceKind::Readback => DeviceNames {
            setpoint: base.to_string(),
            readback: explicit_readback
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            ..Default::default()
        },
    }
}

fn generic(base: &str) -> DeviceNames {
    DeviceNames {
        setpoint: base.to_string(),
        ..Default::default()
    }
}

fn motor(base: &str) -> DeviceNames {
    let record = base.strip_suffix(".RBV").unwrap_or(base);
    DeviceNames {
        setpoint: record.to_string(),
        readback: Some(format!("{}.RBV", record)),
        go: None,
        abort: Some(format!("{}.STOP", record)),
        velocity: Some(format!("{}.VELO", record)),
    }
}

fn pollux(base: &str) -> DeviceNames {
    let root = join_segments(base, 0, 2);
    let (setpoint, readback) = if base.ends_with("ACTPOS") {
        (format!("{}:AO:ABSMOV", root), base.to_string())
    } else {
        (base.to_string(), format!("{}:AI:ACTPOS", root))
    };
    DeviceNames {
        setpoint,
        readback: Some(readback),
        go: Some(format!("{}:BO:GOABS", root)),
        abort: Some(format!("{}:BO:ABORT", root)),
        velocity: Some(format!("{}:AO:VELO", root)),
    }
}

fn beckhoff(base: &str) -> DeviceNames {
    let segments: Vec<&str> = base.split(':').collect();
    let area = segments[0];

    let (readback, go, abort) = if base.contains("ESB") {
        let axis = join_segments(base, 3, 5);
        (
            format!("{}:CALC:{}:POS:MM", area, axis),
            format!("{}:BO:{}:GO:POS", area, axis),
            format!("{}:BO:{}:STOP", area, axis),
        )
    } else if base.contains("UEDM") {
        let axis = if segments.len() >= 2 {
            segments[segments.len() - 2]
        } else {
            ""
        };
        (
            format!("{}:UEDM:AI:{}:POS", area, axis),
            format!("{}:UEDM:BO:{}:GOPOS", area, axis),
            format!("{}:UEDM:{}:STOP", area, axis),
        )
    } else {
        let axis = join_segments(base, 2, 3);
        (
            format!("{}:CALC:{}:POS:MM", area, axis),
            format!("{}:BO:{}:GO:POS:ABS", area, axis),
            format!("{}:BO:{}:STOP", area, axis),
        )
    };

    DeviceNames {
        setpoint: base.to_string(),
        readback: Some(readback),
        go: Some(go),
        abort: Some(abort),
        velocity: None,
    }
}

fn magnet(base: &str) -> DeviceNames {
    let (setpoint, readback) = if base.ends_with("ACT") {
        (base.replace("ACT", "DES"), base.to_string())
    } else {
        (base.to_string(), base.replace("DES", "ACT"))
    };
    DeviceNames {
        setpoint,
        readback: Some(readback),
        ..Default::default()
    }
}

fn lakeshore(base: &str) -> DeviceNames {
    let (setpoint, readback) = if base.ends_with("RBV") {
        let setpoint = base.replace("_RBV", "");
        let readback = setpoint.replace("OUT", "IN").replace(":SP", "");
        (setpoint, readback)
    } else if base.contains("IN") {
        (format!("{}:SP", base.replace("IN", "OUT")), base.to_string())
    } else {
        (
            base.to_string(),
            base.replace("OUT", "IN").replace(":SP", ""),
        )
    };
    DeviceNames {
        setpoint,
        readback: Some(readback),
        ..Default::default()
    }
}

/// Colon segments `[from, to)` re-joined, clamped to the available segments.
fn join_segments(name: &str, from: usize, to: usize) -> String {
    let segments: Vec<&str> = name.split(':').collect();
    let end = to.min(segments.len());
    if from >= end {
        return String::new();
    }
    segments[from..end].join(":")
}
