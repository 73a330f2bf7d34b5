//! Machine state bus
//!
//! [`MachineState`] holds the telemetry reported by the firmware plus the
//! user variables written by run directives. [`MachineStateBus`] keeps one
//! instance behind a reader-writer lock: the protocol engine applies every
//! status report as a single closure under the write lock so readers never
//! observe a half-applied report.
//!
//! Directive and substitution code addresses state by name; the names map to
//! typed fields through [`StateKey`], so a misspelt telemetry key is a
//! lookup miss rather than a silently created entry.

mod keys;

pub use keys::StateKey;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::{Bounds, BufferState, ControllerState, ModalState, Overrides, Position, ProbePoint};
use crate::error::StateError;
use crate::expr::{Value, VarLookup};

/// Snapshot of machine telemetry and variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub controller_state: ControllerState,
    /// Raw state word including sub-state (`Hold:0`)
    pub state_text: String,
    pub machine: Position,
    pub work: Position,
    /// Work coordinate offset (`MPos - WPos`)
    pub wco: Position,
    pub feed: f64,
    pub spindle: f64,
    pub overrides: Overrides,
    pub buffer: Option<BufferState>,
    /// Input pins reported in `Pn:`
    pub pins: String,
    /// Latest probe record
    pub probe: Option<ProbePoint>,
    /// Incremented on every `[PRB:...]`
    pub probe_seq: u64,
    /// Tool length offset
    pub tlo: f64,
    pub modal: ModalState,
    /// Bounding box of the loaded program
    pub program_bounds: Option<Bounds>,
    /// Coordinate offsets from `$#` (`G54`, `G92`, ...)
    pub offsets: BTreeMap<String, Position>,
    /// Firmware settings echoed by `$$`
    pub settings: BTreeMap<u16, String>,
    /// Firmware banner version (`1.1h`)
    pub firmware_version: Option<String>,
    /// Incremented on every parsed status report
    pub status_seq: u64,
    /// Variables written by directives or seeded from configuration
    pub vars: BTreeMap<String, Value>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            controller_state: ControllerState::Disconnected,
            state_text: ControllerState::Disconnected.to_string(),
            machine: Position::default(),
            work: Position::default(),
            wco: Position::default(),
            feed: 0.0,
            spindle: 0.0,
            overrides: Overrides::default(),
            buffer: None,
            pins: String::new(),
            probe: None,
            probe_seq: 0,
            tlo: 0.0,
            modal: ModalState::default(),
            program_bounds: None,
            offsets: BTreeMap::new(),
            settings: BTreeMap::new(),
            firmware_version: None,
            status_seq: 0,
            vars: BTreeMap::new(),
        }
    }
}

impl MachineState {
    /// Value of a typed key
    pub fn key(&self, key: StateKey) -> Value {
        use StateKey::*;
        let bounds = self.program_bounds.unwrap_or(Bounds::at(Position::default()));
        let probe = self.probe.map(|p| p.position).unwrap_or_default();
        match key {
            State => Value::Text(self.state_text.clone()),
            Work(axis) => Value::Number(self.work.get(axis)),
            Machine(axis) => Value::Number(self.machine.get(axis)),
            Wco(axis) => Value::Number(self.wco.get(axis)),
            Probe(axis) => Value::Number(probe.get(axis)),
            ProbeContact => Value::Number(
                if self.probe.is_some_and(|p| p.success) {
                    1.0
                } else {
                    0.0
                },
            ),
            Feed => Value::Number(self.feed),
            Spindle => Value::Number(self.spindle),
            OvFeed => Value::Number(f64::from(self.overrides.feed)),
            OvRapid => Value::Number(f64::from(self.overrides.rapid)),
            OvSpindle => Value::Number(f64::from(self.overrides.spindle)),
            Tlo => Value::Number(self.tlo),
            Wcs => Value::Text(self.modal.wcs.clone()),
            Motion => Value::Text(self.modal.motion.clone()),
            Tool => Value::Number(f64::from(self.modal.tool)),
            BoundsMin(axis) => Value::Number(bounds.min.get(axis)),
            BoundsMax(axis) => Value::Number(bounds.max.get(axis)),
        }
    }

    /// Value by name: typed keys first, then user variables
    pub fn get(&self, name: &str) -> Option<Value> {
        match StateKey::from_name(name) {
            Some(key) => Some(self.key(key)),
            None => self.vars.get(name).cloned(),
        }
    }

    /// Write a value by name
    ///
    /// Telemetry keys are read-only except the tool length offset; any other
    /// name becomes (or overwrites) a user variable.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), StateError> {
        match StateKey::from_name(name) {
            Some(StateKey::Tlo) => {
                self.tlo = value.as_number().ok_or_else(|| StateError::TypeMismatch {
                    key: name.to_string(),
                    expected: "number",
                })?;
                Ok(())
            }
            Some(_) => Err(StateError::ReadOnlyKey {
                key: name.to_string(),
            }),
            None => {
                self.vars.insert(name.to_string(), value);
                Ok(())
            }
        }
    }

    /// Reset telemetry to disconnected defaults, keeping variables
    pub fn reset_telemetry(&mut self) {
        let vars = std::mem::take(&mut self.vars);
        let bounds = self.program_bounds.take();
        *self = MachineState {
            vars,
            program_bounds: bounds,
            ..MachineState::default()
        };
    }
}

impl VarLookup for MachineState {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

/// Shared, lock-guarded machine state
#[derive(Debug, Clone, Default)]
pub struct MachineStateBus {
    inner: Arc<RwLock<MachineState>>,
}

impl MachineStateBus {
    /// Create a bus holding default (disconnected) state
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> MachineState {
        self.inner.read().clone()
    }

    /// Read a projection without cloning the whole state
    pub fn read<R>(&self, f: impl FnOnce(&MachineState) -> R) -> R {
        f(&self.inner.read())
    }

    /// Apply a batch of changes atomically relative to readers
    pub fn update<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Current controller state
    pub fn controller_state(&self) -> ControllerState {
        self.inner.read().controller_state
    }

    /// Value by name
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().get(name)
    }

    /// Write a value by name
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), StateError> {
        self.inner.write().set(name, value.into())
    }

    /// Record the bounding box of the program about to run
    pub fn set_program_bounds(&self, bounds: Option<Bounds>) {
        self.inner.write().program_bounds = bounds;
    }
}
