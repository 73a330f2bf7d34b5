//! G-code program model
//!
//! This module provides:
//! - Word-level line parsing that preserves untouched source text
//! - Modal state tracking with absolute move reconstruction
//! - Block-structured programs with editing and export

pub mod line;
pub mod modal;
pub mod program;

pub use line::{strip_comments, GcodeLine, LineKind, Word};
pub use modal::{ModalTracker, MotionMode, Move, Plane, Point3};
pub use program::{Block, MotionProgram};
