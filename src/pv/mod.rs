//! Process-variable access.
//!
//! Everything in the crate talks to hardware through the [`ProcessVariables`]
//! trait. Two backends are provided: [`CaToolsBackend`], which drives the
//! EPICS command-line tools, and [`SimulatedPvs`], an in-memory store used
//! for tests and dry runs.

pub mod ca;
pub mod sim;

pub use ca::{CaToolsBackend, CaToolsBackendBuilder, CaToolsConfig};
pub use sim::{PvWrite, SimulatedPvs};

use crate::error::ScanError;
use std::fmt;
use std::sync::Arc;

/// A value read from or written to a PV.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Int(i64),
    Double(f64),
    Str(String),
}

impl PvValue {
    /// Interpret text as returned by a channel-access client.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            PvValue::Int(i)
        } else if let Ok(f) = trimmed.parse::<f64>() {
            PvValue::Double(f)
        } else {
            PvValue::Str(trimmed.trim_end_matches('\0').to_string())
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(i) => Some(*i as f64),
            PvValue::Double(f) => Some(*f),
            PvValue::Str(s) => s.trim().trim_end_matches('\0').parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(i) => Some(*i),
            PvValue::Double(f) if f.is_finite() => Some(f.round() as i64),
            PvValue::Double(_) => None,
            PvValue::Str(s) => {
                let s = s.trim().trim_end_matches('\0');
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
            }
        }
    }

    /// Text form with any waveform null terminator removed.
    pub fn as_string(&self) -> String {
        match self {
            PvValue::Int(i) => i.to_string(),
            PvValue::Double(f) => f.to_string(),
            PvValue::Str(s) => s.trim_end_matches('\0').to_string(),
        }
    }

    /// Truthiness of a flag-style PV: non-zero numbers and non-empty strings.
    pub fn is_truthy(&self) -> bool {
        match self {
            PvValue::Int(i) => *i != 0,
            PvValue::Double(f) => *f != 0.0,
            PvValue::Str(s) => match s.trim_end_matches('\0').trim().parse::<f64>() {
                Ok(f) => f != 0.0,
                Err(_) => !s.trim_end_matches('\0').trim().is_empty(),
            },
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(i) => write!(f, "{}", i),
            PvValue::Double(v) => write!(f, "{}", v),
            PvValue::Str(s) => write!(f, "{}", s.trim_end_matches('\0')),
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<i32> for PvValue {
    fn from(v: i32) -> Self {
        PvValue::Int(v as i64)
    }
}

impl From<u32> for PvValue {
    fn from(v: u32) -> Self {
        PvValue::Int(v as i64)
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Double(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Str(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Str(v)
    }
}

/// Backend abstraction over the control system.
///
/// Implementations must be shareable across threads: the data logger samples
/// PVs from its own thread while the scan driver writes from the main one.
pub trait ProcessVariables: Send + Sync {
    /// Whether the named PV is reachable.
    fn connect(&self, name: &str) -> bool;

    /// Current value, or `None` when the PV is unreachable or unreadable.
    fn get(&self, name: &str) -> Option<PvValue>;

    /// Write a value. With `wait` the call returns once the record has
    /// finished processing.
    fn put(&self, name: &str, value: PvValue, wait: bool) -> Result<(), ScanError>;
}

/// Named handle onto a PV of a shared backend.
#[derive(Clone)]
pub struct Pv {
    name: String,
    backend: Arc<dyn ProcessVariables>,
}

impl fmt::Debug for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pv").field(&self.name).finish()
    }
}

impl Pv {
    pub fn new(backend: Arc<dyn ProcessVariables>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        self.backend.connect(&self.name)
    }

    pub fn get(&self) -> Option<PvValue> {
        self.backend.get(&self.name)
    }

    pub fn get_f64(&self) -> Option<f64> {
        self.get().and_then(|v| v.as_f64())
    }

    pub fn get_i64(&self) -> Option<i64> {
        self.get().and_then(|v| v.as_i64())
    }

    /// Flag value; unreadable PVs count as false.
    pub fn get_bool(&self) -> bool {
        self.get().map(|v| v.is_truthy()).unwrap_or(false)
    }

    pub fn get_string(&self) -> Option<String> {
        self.get().map(|v| v.as_string())
    }

    pub fn put(&self, value: impl Into<PvValue>) -> Result<(), ScanError> {
        self.backend.put(&self.name, value.into(), false)
    }

    pub fn put_wait(&self, value: impl Into<PvValue>) -> Result<(), ScanError> {
        self.backend.put(&self.name, value.into(), true)
    }

    /// Write a string to a char-waveform PV, appending the null terminator
    /// the IOC expects.
    pub fn put_str(&self, value: &str) -> Result<(), ScanError> {
        self.backend
            .put(&self.name, PvValue::Str(format!("{}\0", value)), false)
    }

    pub fn put_str_wait(&self, value: &str) -> Result<(), ScanError> {
        self.backend
            .put(&self.name, PvValue::Str(format!("{}\0", value)), true)
    }

    /// Handle to a field or companion record, e.g. `.DESC`.
    pub fn with_suffix(&self, suffix: &str) -> Pv {
        Pv::new(self.backend.clone(), format!("{}{}", self.name, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefers_integers() {
        assert_eq!(PvValue::parse("3"), PvValue::Int(3));
        assert_eq!(PvValue::parse(" 2.5\n"), PvValue::Double(2.5));
        assert_eq!(PvValue::parse("MOTR:1"), PvValue::Str("MOTR:1".into()));
    }

    #[test]
    fn test_string_values_drop_terminator() {
        let v = PvValue::Str("path/to/dir/\0".into());
        assert_eq!(v.as_string(), "path/to/dir/");
        assert_eq!(PvValue::Str("4.0\0".into()).as_f64(), Some(4.0));
    }

    #[test]
    fn test_truthiness() {
        assert!(PvValue::Int(1).is_truthy());
        assert!(!PvValue::Double(0.0).is_truthy());
        assert!(!PvValue::Str("0".into()).is_truthy());
        assert!(!PvValue::Str("".into()).is_truthy());
        assert!(PvValue::Str("Enabled".into()).is_truthy());
    }

    #[test]
    fn test_put_str_appends_terminator() {
        let sim = Arc::new(SimulatedPvs::new());
        let pv = Pv::new(sim.clone(), "CAM:TIFF1:FilePath");
        pv.put_str("/data/run").unwrap();
        let writes = sim.writes_to("CAM:TIFF1:FilePath");
        assert_eq!(writes, vec![PvValue::Str("/data/run\0".into())]);
        assert_eq!(pv.get_string().as_deref(), Some("/data/run"));
    }
}
