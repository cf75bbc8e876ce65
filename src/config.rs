//! Daemon settings and the preferred-sources file.
//!
//! Everything here is loaded once at startup and immutable afterwards.

use std::path::PathBuf;
use std::time::Duration;

use log::{info, warn};

/// Default seconds between reconnect attempts for one device.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// Default seconds a disqualified device stays excluded.
pub const DEFAULT_BLOCK_TTL: Duration = Duration::from_secs(60);
/// Default seconds preferred sources get a head start after a scan begins.
pub const DEFAULT_PREFERRED_GRACE: Duration = Duration::from_secs(6);
pub const DEFAULT_DEBUG_PORT: u16 = 8828;

/// Immutable daemon configuration, assembled from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    /// JSONL output path. None disables the file sink.
    pub output: Option<PathBuf>,
    /// Truncate the output file at startup instead of appending.
    pub truncate: bool,
    /// Substring filters on device names. Empty means match all.
    pub name_filters: Vec<String>,
    /// Substring filters on device identifiers. Empty means match all.
    pub id_filters: Vec<String>,
    /// Cap on simultaneously connected + connecting devices. None means
    /// unbounded.
    pub max_devices: Option<usize>,
    /// Scan without the Heart Rate service filter.
    pub scan_all: bool,
    /// Name substrings of sources that win the race for connection slots.
    pub preferred_names: Vec<String>,
    pub preferred_grace: Duration,
    pub reconnect_backoff: Duration,
    pub block_ttl: Duration,
    /// TCP debug server port. 0 disables the server.
    pub debug_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output: None,
            truncate: false,
            name_filters: Vec::new(),
            id_filters: Vec::new(),
            max_devices: None,
            scan_all: false,
            preferred_names: Vec::new(),
            preferred_grace: DEFAULT_PREFERRED_GRACE,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            block_ttl: DEFAULT_BLOCK_TTL,
            debug_port: DEFAULT_DEBUG_PORT,
        }
    }
}

/// Load preferred source names from a JSON file.
///
/// Accepts a list of strings, a list of objects carrying `name`, `source`,
/// or `address` fields, or an object wrapping such a list under `sources`
/// or `devices`. Anything unreadable yields an empty list.
pub fn load_sources(path: &str) -> Vec<String> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to read sources file {}: {}", path, e);
            return Vec::new();
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse sources file {}: {}", path, e);
            return Vec::new();
        }
    };

    let items = match &value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => map
            .get("sources")
            .or_else(|| map.get("devices"))
            .and_then(|v| v.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    };

    let names: Vec<String> = items.iter().filter_map(source_name).collect();
    info!("Loaded {} preferred source(s) from {}", names.len(), path);
    names
}

fn source_name(item: &serde_json::Value) -> Option<String> {
    match item {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Object(map) => ["name", "source", "address"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> String {
        let dir = std::env::temp_dir().join("hrfeed_config_test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_sources_list_of_strings() {
        let path = write_temp("strings.json", r#"["Polar H10", "Watch"]"#);
        assert_eq!(load_sources(&path), vec!["Polar H10", "Watch"]);
    }

    #[test]
    fn test_sources_list_of_objects() {
        let path = write_temp(
            "objects.json",
            r#"[{"name": "Polar H10"}, {"source": "Watch"}, {"address": "AA:BB"}, {"rssi": -40}]"#,
        );
        assert_eq!(load_sources(&path), vec!["Polar H10", "Watch", "AA:BB"]);
    }

    #[test]
    fn test_sources_wrapped_object() {
        let path = write_temp(
            "wrapped.json",
            r#"{"sources": ["Polar H10", {"name": "Watch"}]}"#,
        );
        assert_eq!(load_sources(&path), vec!["Polar H10", "Watch"]);

        let path = write_temp("devices.json", r#"{"devices": ["Strap"]}"#);
        assert_eq!(load_sources(&path), vec!["Strap"]);
    }

    #[test]
    fn test_sources_junk() {
        let path = write_temp("junk.json", "not json");
        assert!(load_sources(&path).is_empty());

        let path = write_temp("scalar.json", "42");
        assert!(load_sources(&path).is_empty());

        assert!(load_sources("/tmp/hrfeed_nonexistent_sources.json").is_empty());
    }

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert_eq!(s.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(s.block_ttl, Duration::from_secs(60));
        assert_eq!(s.preferred_grace, Duration::from_secs(6));
        assert!(s.max_devices.is_none());
        assert!(!s.scan_all);
    }
}
