//! Settings errors
//!
//! [`ConfigError`] is a rejected configuration value or file kind;
//! [`SettingsError`] adds the I/O and encoding failures of reading and
//! writing configuration files.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    /// No platform configuration directory
    #[error("Config directory error: {0}")]
    ConfigDirectory(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// File extension other than `.toml` or `.json`
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A `section.key` value outside what the controller can use
    #[error("Value out of range for '{key}': {value}")]
    ValueOutOfRange { key: String, value: String },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_key() {
        let err = ConfigError::ValueOutOfRange {
            key: "connection.rx_buffer_size".to_string(),
            value: "0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Value out of range for 'connection.rx_buffer_size': 0"
        );
        assert_eq!(
            SettingsError::from(err).to_string(),
            "Config error: Value out of range for 'connection.rx_buffer_size': 0"
        );
    }

    #[test]
    fn test_file_errors_convert() {
        let missing: SettingsError = io::Error::new(io::ErrorKind::NotFound, "config.toml").into();
        assert!(matches!(missing, SettingsError::IoError(_)));

        let bad_toml: SettingsError = toml::from_str::<toml::Value>("baud_rate = ")
            .unwrap_err()
            .into();
        assert!(matches!(bad_toml, SettingsError::TomlError(_)));

        let format: SettingsError = ConfigError::UnsupportedFormat("settings.ini".into()).into();
        assert_eq!(
            format.to_string(),
            "Config error: Unsupported config format: settings.ini"
        );
    }
}
