//! # cncstream
//!
//! Headless G-code streaming backend for GRBL controllers:
//! - Character-counted streaming with FIFO acknowledgment accounting
//! - Run directives, expressions and tool-change suspension
//! - Autolevel probing and height-map compensation
//! - Marker-based workpiece orientation
//!
//! ## Architecture
//!
//! 1. **cncstream-core** - state bus, event bus, errors, expressions
//! 2. **cncstream-gcode** - line parser, modal interpreter, block programs
//! 3. **cncstream-settings** - typed configuration and stores
//! 4. **cncstream-communication** - transports, protocol engine, run controller
//! 5. **cncstream-camtools** - autolevel and orientation
//! 6. **cncstream** - logging setup and the command line tool

use std::path::Path;

use anyhow::Context;

pub use cncstream_camtools::{Autolevel, HeightMap, Orientation, ProbeGrid};
pub use cncstream_communication::{CncController, RunController, SimulatedGrbl};
pub use cncstream_core::{AppEvent, EventBus, MachineState, MachineStateBus};
pub use cncstream_gcode::MotionProgram;
pub use cncstream_settings::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` level. With `json` set, records
/// are written as one JSON object per line.
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("installing JSON log subscriber")?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_names(true),
            )
            .try_init()
            .context("installing log subscriber")?;
    }
    Ok(())
}

/// Configuration from `path`, the default location, or built-in defaults
///
/// An explicit path must exist; a missing default file falls back to the
/// defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()));
    }
    match Config::default_path() {
        Ok(default) if default.exists() => Config::load_from_file(&default)
            .with_context(|| format!("loading configuration from {}", default.display())),
        _ => {
            tracing::debug!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}
