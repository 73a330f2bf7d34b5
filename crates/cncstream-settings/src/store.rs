//! Key/section-scoped configuration stores
//!
//! A [`ConfigStore`] holds string values addressed by `(section, key)`; the
//! typed getters parse on read and fall back to the supplied default when a
//! key is missing or does not parse.

use std::collections::BTreeMap;

/// Backend holding configuration values
pub trait ConfigStore: Send + Sync {
    /// Raw string value
    fn get_raw(&self, section: &str, key: &str) -> Option<String>;

    /// Store a raw string value
    fn set_raw(&mut self, section: &str, key: &str, value: String);

    fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.get_raw(section, key)
            .unwrap_or_else(|| default.to_string())
    }

    fn get_float(&self, section: &str, key: &str, default: f64) -> f64 {
        self.get_raw(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.get_raw(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Accepts `true/false`, `1/0`, `yes/no`, `on/off`
    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_raw(section, key) {
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            None => default,
        }
    }

    fn set_str(&mut self, section: &str, key: &str, value: &str) {
        self.set_raw(section, key, value.to_string());
    }

    fn set_float(&mut self, section: &str, key: &str, value: f64) {
        self.set_raw(section, key, value.to_string());
    }

    fn set_int(&mut self, section: &str, key: &str, value: i64) {
        self.set_raw(section, key, value.to_string());
    }

    fn set_bool(&mut self, section: &str, key: &str, value: bool) {
        self.set_raw(section, key, value.to_string());
    }
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    values: BTreeMap<(String, String), String>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys present in a section
    pub fn keys(&self, section: &str) -> Vec<String> {
        self.values
            .keys()
            .filter(|(s, _)| s == section)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_raw(&self, section: &str, key: &str) -> Option<String> {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    }

    fn set_raw(&mut self, section: &str, key: &str, value: String) {
        self.values
            .insert((section.to_string(), key.to_string()), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut store = MemoryConfigStore::new();
        store.set_float("probe", "feed", 12.5);
        store.set_int("connection", "baud_rate", 250000);
        store.set_raw("tool_change", "wait_after_probe", "No".into());
        store.set_str("probe", "command", "G38.3");

        assert_eq!(store.get_float("probe", "feed", 0.0), 12.5);
        assert_eq!(store.get_int("connection", "baud_rate", 0), 250000);
        assert!(!store.get_bool("tool_change", "wait_after_probe", true));
        assert_eq!(store.get_str("probe", "command", "G38.2"), "G38.3");
        assert_eq!(store.keys("probe"), vec!["command", "feed"]);
    }

    #[test]
    fn test_defaults_on_missing_or_unparseable() {
        let mut store = MemoryConfigStore::new();
        store.set_str("probe", "feed", "fast");
        assert_eq!(store.get_float("probe", "feed", 10.0), 10.0);
        assert_eq!(store.get_int("probe", "missing", -3), -3);
        assert!(store.get_bool("probe", "missing", true));
        assert_eq!(store.len(), 1);
    }
}
