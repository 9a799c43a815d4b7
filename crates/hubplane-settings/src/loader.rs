//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BackplaneSettings;

/// Load settings from `path` with env var overrides.
///
/// A missing file yields the defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BackplaneSettings> {
    let defaults = serde_json::to_value(BackplaneSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BackplaneSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HUBPLANE_*` environment variable overrides.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut BackplaneSettings) {
    if let Some(v) = read_env_string("HUBPLANE_APPLICATION_NAME") {
        settings.application_name = v;
    }
    if let Some(v) = read_env_string("HUBPLANE_CONNECTION_STRING") {
        settings.connection_string = v;
    }
    if let Some(v) = read_env_string("HUBPLANE_SERVER_NAME") {
        settings.server_name = Some(v);
    }
    if let Some(v) = read_env_u64("HUBPLANE_ACK_TIMEOUT_MS", 100, 3_600_000) {
        settings.ack.timeout_ms = v;
    }
    if let Some(v) = read_env_u64("HUBPLANE_ACK_SWEEP_INTERVAL_MS", 10, 600_000) {
        settings.ack.sweep_interval_ms = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use serde_json::json;
    use std::io::Write;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn deep_merge_nested_objects() {
        let target = json!({"ack": {"timeoutMs": 30000, "sweepIntervalMs": 5000}});
        let source = json!({"ack": {"timeoutMs": 100}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["ack"]["timeoutMs"], 100);
        assert_eq!(merged["ack"]["sweepIntervalMs"], 5000);
    }

    #[test]
    fn deep_merge_skips_null() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2, 3]}), json!({"a": [9]}));
        assert_eq!(merged["a"], json!([9]));
    }

    // ── parse_u64_range ─────────────────────────────────────────────

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("100", 100, 200), Some(100));
        assert_eq!(parse_u64_range("200", 100, 200), Some(200));
        assert_eq!(parse_u64_range("99", 100, 200), None);
        assert_eq!(parse_u64_range("201", 100, 200), None);
        assert_eq!(parse_u64_range("abc", 100, 200), None);
        assert_eq!(parse_u64_range("-5", 0, 200), None);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.ack.timeout_ms, BackplaneSettings::default().ack.timeout_ms);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"serverName": "node-7", "ack": {{"sweepIntervalMs": 250}}}}"#
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server_name.as_deref(), Some("node-7"));
        assert_eq!(settings.ack.sweep_interval_ms, 250);
        assert_eq!(settings.ack.timeout_ms, 30_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }
}
