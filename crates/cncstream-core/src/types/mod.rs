//! Type system utilities and aliases.
//!
//! - [`aliases`]: Type aliases for `Arc<Mutex<T>>`, shared queues and read-mostly values.

pub mod aliases;

pub use aliases::*;
