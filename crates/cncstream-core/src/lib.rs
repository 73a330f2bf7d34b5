//! # cncstream Core
//!
//! Core types shared by every cncstream crate:
//! the machine state bus, the event bus, controller data types,
//! the directive expression evaluator and the error taxonomy.

pub mod data;
pub mod error;
pub mod event_bus;
pub mod expr;
pub mod state;
pub mod types;

pub use data::{
    Axis, Bounds, BufferState, ControllerState, ModalState, Overrides, Position, ProbePoint, Units,
};

pub use error::{
    CommandRejected, ConnectionError, Error, GcodeError, ProtocolError, Result, RunError,
    StateError,
};

pub use event_bus::{
    AppEvent, AutolevelEvent, ConnectionEvent, DisconnectReason, ErrorEvent, EventBus,
    EventBusConfig, EventBusError, EventCategory, EventFilter, MachineEvent, OrientEvent,
    RunEvent, RunOutcome, SerialEvent, SubscriptionId,
};

pub use expr::{format_number, Expr, ExprError, Value, VarLookup};

pub use state::{MachineState, MachineStateBus, StateKey};

pub use types::{
    thread_safe, thread_safe_deque, thread_safe_rw, ThreadSafe, ThreadSafeDeque,
    ThreadSafeRw,
};
