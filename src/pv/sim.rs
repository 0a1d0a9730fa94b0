use super::{ProcessVariables, PvValue};
use crate::error::ScanError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;

type Reaction = Box<dyn Fn(&PvValue, &mut HashMap<String, PvValue>) + Send + Sync>;

/// One recorded put.
#[derive(Debug, Clone, PartialEq)]
pub struct PvWrite {
    pub name: String,
    pub value: PvValue,
    pub wait: bool,
}

#[derive(Default)]
struct SimState {
    values: HashMap<String, PvValue>,
    disconnected: HashSet<String>,
    links: HashMap<String, Vec<String>>,
    reactions: HashMap<String, Reaction>,
    writes: Vec<PvWrite>,
}

/// In-memory control system.
///
/// Puts are journaled so callers can assert on the exact sequence of
/// hardware commands. Setpoints can be linked to readbacks so moves settle
/// immediately, and arbitrary reactions can emulate record processing
/// (e.g. a camera clearing its capture flag).
#[derive(Default)]
pub struct SimulatedPvs {
    state: Mutex<SimState>,
}

impl SimulatedPvs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object of `{"PV:NAME": value}` pairs.
    pub fn from_json(json: &str) -> Result<Self, ScanError> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| ScanError::Config(format!("invalid PV snapshot: {}", e)))?;

        let sim = Self::new();
        for (name, value) in raw {
            let value = match value {
                serde_json::Value::Bool(b) => PvValue::Int(b as i64),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => PvValue::Int(i),
                    None => PvValue::Double(n.as_f64().unwrap_or(0.0)),
                },
                serde_json::Value::String(s) => PvValue::Str(s),
                other => {
                    return Err(ScanError::Config(format!(
                        "unsupported snapshot value for {}: {}",
                        name, other
                    )));
                }
            };
            sim.set(&name, value);
        }
        Ok(sim)
    }

    pub fn load_snapshot(path: &Path) -> Result<Self, ScanError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::io(e, format!("reading {}", path.display())))?;
        Self::from_json(&text)
    }

    /// Set a value without journaling it as a write.
    pub fn set(&self, name: &str, value: impl Into<PvValue>) {
        let mut state = self.state.lock();
        state.values.insert(name.to_string(), value.into());
        state.disconnected.remove(name);
    }

    pub fn value(&self, name: &str) -> Option<PvValue> {
        self.state.lock().values.get(name).cloned()
    }

    pub fn disconnect(&self, name: &str) {
        self.state.lock().disconnected.insert(name.to_string());
    }

    /// Mirror every put on `setpoint` into `readback`.
    pub fn link(&self, setpoint: &str, readback: &str) {
        self.state
            .lock()
            .links
            .entry(setpoint.to_string())
            .or_default()
            .push(readback.to_string());
    }

    /// Run `reaction` after every put on `name`.
    pub fn on_put<F>(&self, name: &str, reaction: F)
    where
        F: Fn(&PvValue, &mut HashMap<String, PvValue>) + Send + Sync + 'static,
    {
        self.state
            .lock()
            .reactions
            .insert(name.to_string(), Box::new(reaction));
    }

    pub fn writes(&self) -> Vec<PvWrite> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, name: &str) -> Vec<PvValue> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.name == name)
            .map(|w| w.value.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

impl ProcessVariables for SimulatedPvs {
    fn connect(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.values.contains_key(name) && !state.disconnected.contains(name)
    }

    fn get(&self, name: &str) -> Option<PvValue> {
        let state = self.state.lock();
        if state.disconnected.contains(name) {
            return None;
        }
        state.values.get(name).cloned()
    }

    fn put(&self, name: &str, value: PvValue, wait: bool) -> Result<(), ScanError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.disconnected.contains(name) {
            return Err(ScanError::pv(name, "not connected"));
        }

        state.writes.push(PvWrite {
            name: name.to_string(),
            value: value.clone(),
            wait,
        });
        state.values.insert(name.to_string(), value.clone());

        if let Some(targets) = state.links.get(name) {
            for target in targets {
                state.values.insert(target.clone(), value.clone());
            }
        }
        if let Some(reaction) = state.reactions.get(name) {
            reaction(&value, &mut state.values);
        }
        Ok(())
    }
}
