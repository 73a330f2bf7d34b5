//! Configuration and settings management for cncstream
//!
//! Provides typed configuration sections with defaults, validation, a bridge
//! to key/section-scoped [`ConfigStore`] backends, and JSON/TOML file I/O.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (port, baud, handshake and polling intervals)
//! - Probe defaults (feeds, probe command, tool length offset)
//! - Autolevel grid defaults
//! - Tool-change policy and positions
//! - Machine preferences (axis count, jog feed)

use cncstream_core::Units;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
use crate::store::ConfigStore;

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Last used serial port
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Handshake timeout in milliseconds (0 skips the handshake)
    pub timeout_ms: u64,
    /// Firmware receive buffer capacity in bytes
    pub rx_buffer_size: usize,
    /// Status query interval in milliseconds
    pub status_poll_ms: u64,
    /// Transport read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "Auto".to_string(),
            baud_rate: 115200,
            timeout_ms: 5000,
            rx_buffer_size: 128,
            status_poll_ms: 200,
            read_timeout_ms: 20,
        }
    }
}

/// Probing defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Feed of the first (fast) probing pass
    pub fast_feed: f64,
    /// Feed of the final probing pass
    pub feed: f64,
    /// Probe command (`G38.2` .. `G38.5`)
    pub command: String,
    /// Tool length offset applied on connect
    pub tlo: f64,
    /// Safe retract height
    pub safe_z: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            fast_feed: 100.0,
            feed: 10.0,
            command: "G38.2".to_string(),
            tlo: 0.0,
            safe_z: 3.0,
        }
    }
}

/// Autolevel grid defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutolevelSettings {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    pub step_x: f64,
    pub step_y: f64,
    /// Probe target depth
    pub zmin: f64,
    /// Travel height between points
    pub zmax: f64,
    /// Timeout of a single probe point in milliseconds
    pub probe_timeout_ms: u64,
}

impl Default for AutolevelSettings {
    fn default() -> Self {
        Self {
            xmin: 0.0,
            xmax: 10.0,
            ymin: 0.0,
            ymax: 10.0,
            step_x: 2.5,
            step_y: 2.5,
            zmin: -10.0,
            zmax: 3.0,
            probe_timeout_ms: 60_000,
        }
    }
}

/// What to do when a program reaches `M6`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolChangePolicy {
    /// Send `M6` to the firmware unchanged
    #[default]
    Pass,
    /// Drop the `M6` line
    Ignore,
    /// Manual change, re-probe and set the work Z with `G10 L20`
    Wcs,
    /// Manual change, re-probe and compensate with a tool length offset
    Tlo,
    /// Manual change without probing
    NoProbe,
}

impl ToolChangePolicy {
    /// Numeric index used by stores (0 pass .. 4 no-probe)
    pub fn index(self) -> i64 {
        match self {
            Self::Pass => 0,
            Self::Ignore => 1,
            Self::Wcs => 2,
            Self::Tlo => 3,
            Self::NoProbe => 4,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Pass),
            1 => Some(Self::Ignore),
            2 => Some(Self::Wcs),
            3 => Some(Self::Tlo),
            4 => Some(Self::NoProbe),
            _ => None,
        }
    }

    /// True for the policies that probe the new tool
    pub fn probes(self) -> bool {
        matches!(self, Self::Wcs | Self::Tlo)
    }
}

impl std::fmt::Display for ToolChangePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Ignore => write!(f, "ignore"),
            Self::Wcs => write!(f, "wcs"),
            Self::Tlo => write!(f, "tlo"),
            Self::NoProbe => write!(f, "no-probe"),
        }
    }
}

/// Tool-change settings
///
/// Change and probe positions are machine coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolChangeSettings {
    pub policy: ToolChangePolicy,
    /// Suspend again after probing so the operator can restart the spindle
    pub wait_after_probe: bool,
    pub change_x: f64,
    pub change_y: f64,
    pub change_z: f64,
    pub probe_x: f64,
    pub probe_y: f64,
    pub probe_z: f64,
    /// Probing distance below `probe_z`
    pub distance: f64,
    /// Work Z of the tool setter surface
    pub tool_height: f64,
    /// Machine Z of the reference tool contact
    pub tool_mz: f64,
}

impl Default for ToolChangeSettings {
    fn default() -> Self {
        Self {
            policy: ToolChangePolicy::Pass,
            wait_after_probe: true,
            change_x: 0.0,
            change_y: 0.0,
            change_z: -1.0,
            probe_x: 0.0,
            probe_y: 0.0,
            probe_z: -1.0,
            distance: 10.0,
            tool_height: 0.0,
            tool_mz: 0.0,
        }
    }
}

/// Machine preference settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// 3 for XYZ machines, up to 6 with rotary axes
    pub axis_count: u8,
    /// Default jog increment
    pub jog_increment: f64,
    /// Default jog feed rate in units/min
    pub jog_feed_rate: f64,
    pub units: Units,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            axis_count: 3,
            jog_increment: 1.0,
            jog_feed_rate: 1000.0,
            units: Units::MM,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub probe: ProbeSettings,
    pub autolevel: AutolevelSettings,
    pub tool_change: ToolChangeSettings,
    pub machine: MachineSettings,
}

fn out_of_range(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::ValueOutOfRange {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform configuration file location
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("cncstream").join("config.toml"))
            .ok_or_else(|| SettingsError::ConfigDirectory("no configuration directory".into()))
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()).into());
        };

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self)?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()).into());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let c = &self.connection;
        if c.baud_rate == 0 {
            return Err(out_of_range("connection.baud_rate", c.baud_rate));
        }
        if c.rx_buffer_size == 0 {
            return Err(out_of_range("connection.rx_buffer_size", c.rx_buffer_size));
        }
        if c.status_poll_ms == 0 {
            return Err(out_of_range("connection.status_poll_ms", c.status_poll_ms));
        }
        if c.read_timeout_ms == 0 {
            return Err(out_of_range("connection.read_timeout_ms", c.read_timeout_ms));
        }

        let p = &self.probe;
        if p.feed <= 0.0 {
            return Err(out_of_range("probe.feed", p.feed));
        }
        if p.fast_feed < 0.0 {
            return Err(out_of_range("probe.fast_feed", p.fast_feed));
        }
        if !matches!(p.command.as_str(), "G38.2" | "G38.3" | "G38.4" | "G38.5") {
            return Err(out_of_range("probe.command", &p.command));
        }

        let a = &self.autolevel;
        if a.xmax <= a.xmin {
            return Err(out_of_range("autolevel.xmax", a.xmax));
        }
        if a.ymax <= a.ymin {
            return Err(out_of_range("autolevel.ymax", a.ymax));
        }
        if a.step_x <= 0.0 {
            return Err(out_of_range("autolevel.step_x", a.step_x));
        }
        if a.step_y <= 0.0 {
            return Err(out_of_range("autolevel.step_y", a.step_y));
        }
        if a.zmax <= a.zmin {
            return Err(out_of_range("autolevel.zmax", a.zmax));
        }

        if self.tool_change.distance <= 0.0 {
            return Err(out_of_range("tool_change.distance", self.tool_change.distance));
        }

        let m = &self.machine;
        if !(3..=6).contains(&m.axis_count) {
            return Err(out_of_range("machine.axis_count", m.axis_count));
        }
        if m.jog_feed_rate <= 0.0 {
            return Err(out_of_range("machine.jog_feed_rate", m.jog_feed_rate));
        }

        Ok(())
    }

    /// Read every section from a store, falling back to defaults per key
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let d = Config::default();
        let tool_policy = store.get_int("tool_change", "policy", d.tool_change.policy.index());
        Self {
            connection: ConnectionSettings {
                port: store.get_str("connection", "port", &d.connection.port),
                baud_rate: store.get_int("connection", "baud_rate", i64::from(d.connection.baud_rate))
                    as u32,
                timeout_ms: store.get_int("connection", "timeout_ms", d.connection.timeout_ms as i64)
                    as u64,
                rx_buffer_size: store.get_int(
                    "connection",
                    "rx_buffer_size",
                    d.connection.rx_buffer_size as i64,
                ) as usize,
                status_poll_ms: store.get_int(
                    "connection",
                    "status_poll_ms",
                    d.connection.status_poll_ms as i64,
                ) as u64,
                read_timeout_ms: store.get_int(
                    "connection",
                    "read_timeout_ms",
                    d.connection.read_timeout_ms as i64,
                ) as u64,
            },
            probe: ProbeSettings {
                fast_feed: store.get_float("probe", "fast_feed", d.probe.fast_feed),
                feed: store.get_float("probe", "feed", d.probe.feed),
                command: store.get_str("probe", "command", &d.probe.command),
                tlo: store.get_float("probe", "tlo", d.probe.tlo),
                safe_z: store.get_float("probe", "safe_z", d.probe.safe_z),
            },
            autolevel: AutolevelSettings {
                xmin: store.get_float("autolevel", "xmin", d.autolevel.xmin),
                xmax: store.get_float("autolevel", "xmax", d.autolevel.xmax),
                ymin: store.get_float("autolevel", "ymin", d.autolevel.ymin),
                ymax: store.get_float("autolevel", "ymax", d.autolevel.ymax),
                step_x: store.get_float("autolevel", "step_x", d.autolevel.step_x),
                step_y: store.get_float("autolevel", "step_y", d.autolevel.step_y),
                zmin: store.get_float("autolevel", "zmin", d.autolevel.zmin),
                zmax: store.get_float("autolevel", "zmax", d.autolevel.zmax),
                probe_timeout_ms: store.get_int(
                    "autolevel",
                    "probe_timeout_ms",
                    d.autolevel.probe_timeout_ms as i64,
                ) as u64,
            },
            tool_change: ToolChangeSettings {
                policy: ToolChangePolicy::from_index(tool_policy).unwrap_or_default(),
                wait_after_probe: store.get_bool(
                    "tool_change",
                    "wait_after_probe",
                    d.tool_change.wait_after_probe,
                ),
                change_x: store.get_float("tool_change", "change_x", d.tool_change.change_x),
                change_y: store.get_float("tool_change", "change_y", d.tool_change.change_y),
                change_z: store.get_float("tool_change", "change_z", d.tool_change.change_z),
                probe_x: store.get_float("tool_change", "probe_x", d.tool_change.probe_x),
                probe_y: store.get_float("tool_change", "probe_y", d.tool_change.probe_y),
                probe_z: store.get_float("tool_change", "probe_z", d.tool_change.probe_z),
                distance: store.get_float("tool_change", "distance", d.tool_change.distance),
                tool_height: store.get_float("tool_change", "tool_height", d.tool_change.tool_height),
                tool_mz: store.get_float("tool_change", "tool_mz", d.tool_change.tool_mz),
            },
            machine: MachineSettings {
                axis_count: store.get_int("machine", "axis_count", i64::from(d.machine.axis_count))
                    as u8,
                jog_increment: store.get_float("machine", "jog_increment", d.machine.jog_increment),
                jog_feed_rate: store.get_float("machine", "jog_feed_rate", d.machine.jog_feed_rate),
                units: match store.get_str("machine", "units", "mm").as_str() {
                    "in" | "inch" => Units::INCH,
                    _ => Units::MM,
                },
            },
        }
    }

    /// Write every section to a store
    pub fn write_to_store(&self, store: &mut dyn ConfigStore) {
        let c = &self.connection;
        store.set_str("connection", "port", &c.port);
        store.set_int("connection", "baud_rate", i64::from(c.baud_rate));
        store.set_int("connection", "timeout_ms", c.timeout_ms as i64);
        store.set_int("connection", "rx_buffer_size", c.rx_buffer_size as i64);
        store.set_int("connection", "status_poll_ms", c.status_poll_ms as i64);
        store.set_int("connection", "read_timeout_ms", c.read_timeout_ms as i64);

        let p = &self.probe;
        store.set_float("probe", "fast_feed", p.fast_feed);
        store.set_float("probe", "feed", p.feed);
        store.set_str("probe", "command", &p.command);
        store.set_float("probe", "tlo", p.tlo);
        store.set_float("probe", "safe_z", p.safe_z);

        let a = &self.autolevel;
        store.set_float("autolevel", "xmin", a.xmin);
        store.set_float("autolevel", "xmax", a.xmax);
        store.set_float("autolevel", "ymin", a.ymin);
        store.set_float("autolevel", "ymax", a.ymax);
        store.set_float("autolevel", "step_x", a.step_x);
        store.set_float("autolevel", "step_y", a.step_y);
        store.set_float("autolevel", "zmin", a.zmin);
        store.set_float("autolevel", "zmax", a.zmax);
        store.set_int("autolevel", "probe_timeout_ms", a.probe_timeout_ms as i64);

        let t = &self.tool_change;
        store.set_int("tool_change", "policy", t.policy.index());
        store.set_bool("tool_change", "wait_after_probe", t.wait_after_probe);
        store.set_float("tool_change", "change_x", t.change_x);
        store.set_float("tool_change", "change_y", t.change_y);
        store.set_float("tool_change", "change_z", t.change_z);
        store.set_float("tool_change", "probe_x", t.probe_x);
        store.set_float("tool_change", "probe_y", t.probe_y);
        store.set_float("tool_change", "probe_z", t.probe_z);
        store.set_float("tool_change", "distance", t.distance);
        store.set_float("tool_change", "tool_height", t.tool_height);
        store.set_float("tool_change", "tool_mz", t.tool_mz);

        let m = &self.machine;
        store.set_int("machine", "axis_count", i64::from(m.axis_count));
        store.set_float("machine", "jog_increment", m.jog_increment);
        store.set_float("machine", "jog_feed_rate", m.jog_feed_rate);
        store.set_str("machine", "units", &m.units.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfigStore;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.rx_buffer_size, 128);
        assert_eq!(config.probe.command, "G38.2");
        assert_eq!(config.tool_change.policy, ToolChangePolicy::Pass);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.probe.command = "G1".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValueOutOfRange { ref key, .. }) if key == "probe.command"
        ));

        let mut config = Config::default();
        config.autolevel.xmax = config.autolevel.xmin;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.machine.axis_count = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_index() {
        for i in 0..5 {
            assert_eq!(ToolChangePolicy::from_index(i).unwrap().index(), i);
        }
        assert_eq!(ToolChangePolicy::from_index(7), None);
        assert!(ToolChangePolicy::Tlo.probes());
        assert!(!ToolChangePolicy::NoProbe.probes());
    }

    #[test]
    fn test_store_round_trip() {
        let mut config = Config::default();
        config.tool_change.policy = ToolChangePolicy::Tlo;
        config.probe.feed = 25.0;
        config.machine.units = Units::INCH;
        config.connection.port = "/dev/ttyUSB0".into();

        let mut store = MemoryConfigStore::new();
        config.write_to_store(&mut store);
        assert_eq!(Config::from_store(&store), config);
    }

    #[test]
    fn test_missing_store_keys_use_defaults() {
        let mut store = MemoryConfigStore::new();
        store.set_float("probe", "feed", 42.0);
        let config = Config::from_store(&store);
        assert_eq!(config.probe.feed, 42.0);
        assert_eq!(config.probe.fast_feed, 100.0);
        assert_eq!(config.connection.baud_rate, 115200);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.autolevel.step_x = 5.0;

        for name in ["config.toml", "config.json"] {
            let path = dir.path().join(name);
            config.save_to_file(&path).unwrap();
            assert_eq!(Config::load_from_file(&path).unwrap(), config);
        }

        let bad = dir.path().join("config.yaml");
        assert!(matches!(
            config.save_to_file(&bad),
            Err(SettingsError::Config(ConfigError::UnsupportedFormat(_)))
        ));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[probe]\nfeed = 5.0\n").unwrap();
        assert_eq!(config.probe.feed, 5.0);
        assert_eq!(config.autolevel.zmin, -10.0);
    }
}
