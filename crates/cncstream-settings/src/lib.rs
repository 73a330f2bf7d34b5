//! cncstream Settings Crate
//!
//! Handles application configuration, key/section configuration stores and
//! settings persistence.

pub mod config;
pub mod error;
pub mod store;

pub use config::{
    AutolevelSettings, Config, ConnectionSettings, MachineSettings, ProbeSettings,
    ToolChangePolicy, ToolChangeSettings,
};
pub use error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
pub use store::{ConfigStore, MemoryConfigStore};
