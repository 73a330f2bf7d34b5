//! # cncstream G-code
//!
//! G-code line parsing, modal interpretation and block-structured motion
//! programs for cncstream.

pub mod gcode;

pub use gcode::{
    strip_comments, Block, GcodeLine, LineKind, ModalTracker, MotionMode, MotionProgram, Move,
    Plane, Point3, Word,
};
