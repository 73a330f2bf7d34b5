//! # Event Bus Module
//!
//! Publish/subscribe dispatch from the backend to its observers:
//! - Publishers emit typed events without knowing subscribers
//! - Subscribers filter by category and receive events of interest
//! - Synchronous handlers and async broadcast receivers are both supported
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cncstream_core::event_bus::{AppEvent, EventBus, EventCategory, EventFilter, RunEvent};
//!
//! let bus = EventBus::new();
//! let subscription = bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Run]),
//!     |event| {
//!         if let AppEvent::Run(RunEvent::Progress { completed, total }) = event {
//!             println!("{}/{}", completed, total);
//!         }
//!     },
//! );
//!
//! bus.unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
