//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BobSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `BOB_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::BobSettings;

/// Resolve the default settings file (`~/.bob/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".bob").join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<BobSettings> {
    load_with(path, |name| std::env::var(name).ok())
}

/// Load settings, resolving overrides through `lookup` instead of the
/// process environment.
pub fn load_with<F>(path: &Path, lookup: F) -> Result<BobSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(BobSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BobSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, &lookup);
    settings.validate()?;
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides resolved through `lookup`.
///
/// Empty values are ignored. Unparseable or out-of-range values are logged
/// and ignored, leaving the file/default value in place.
pub fn apply_overrides<F>(settings: &mut BobSettings, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env(lookup);

    // ── Listeners ───────────────────────────────────────────────────
    if let Some(v) = env.string("BOB_BRAINS_HOST") {
        settings.brains.host = v;
    }
    if let Some(v) = env.u16("BOB_BRAINS_PORT", 1, 65535) {
        settings.brains.port = v;
    }
    if let Some(v) = env.u64("BOB_BRAINS_TIMEOUT_MS", 100, 600_000) {
        settings.brains.timeout_ms = v;
    }
    if let Some(v) = env.u64("BOB_BRAINS_REGISTER_TIMEOUT_MS", 100, 600_000) {
        settings.brains.register_timeout_ms = v;
    }
    if let Some(v) = env.string("BOB_CLIENTS_HOST") {
        settings.clients.host = v;
    }
    if let Some(v) = env.u16("BOB_CLIENTS_PORT", 1, 65535) {
        settings.clients.port = v;
    }
    if let Some(v) = env.string("BOB_CLIENTS_PUBLIC_ADDR") {
        settings.clients.public_addr = Some(v);
    }
    if let Some(v) = env.u64("BOB_CLIENTS_TIMEOUT_MS", 100, 600_000) {
        settings.clients.timeout_ms = v;
    }

    // ── WebSocket ───────────────────────────────────────────────────
    if let Some(v) = env.u64("BOB_WS_PING_INTERVAL_MS", 100, 600_000) {
        settings.websocket.ping_interval_ms = v;
    }
    if let Some(v) = env.u64("BOB_WS_PONG_TIMEOUT_MS", 100, 3_600_000) {
        settings.websocket.pong_timeout_ms = v;
    }
    if let Some(v) = env.usize("BOB_WS_MAX_SEND_QUEUE", 1, 65_536) {
        settings.websocket.max_send_queue = v;
    }

    // ── Misc ────────────────────────────────────────────────────────
    if let Some(v) = env.string("BOB_RESOURCES_DIR") {
        settings.resources_directory = v;
    }
    if let Some(v) = env.u64("BOB_HEARING_SAMPLE_RATE", 1, 384_000) {
        settings.hearing.sample_rate = v as u32;
    }
    if let Some(v) = env.u64("BOB_HEARING_DISPATCH_PERIOD_MS", 1, 600_000) {
        settings.hearing.dispatch_period_ms = Some(v);
    }
    if let Some(v) = env.string("BOB_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("BOB_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Override readers (thin wrappers) ────────────────────────────────────────

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn write_settings(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"brains": {"port": 4000, "host": "127.0.0.1"}});
        let source = serde_json::json!({"brains": {"port": 9000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["brains"]["port"], 9000);
        assert_eq!(merged["brains"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    // ── load_with ───────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_with(Path::new("/nonexistent/settings.json"), no_env).unwrap();
        assert_eq!(settings, BobSettings::default());
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let (_dir, path) = write_settings(
            r#"{"clients": {"port": 9001, "publicAddr": "bob.lan:80"}, "hearing": {"dispatchPeriodMs": 250}}"#,
        );
        let settings = load_with(&path, no_env).unwrap();
        assert_eq!(settings.clients.port, 9001);
        assert_eq!(settings.clients.public_addr.as_deref(), Some("bob.lan:80"));
        assert_eq!(settings.clients.host, "127.0.0.1");
        assert_eq!(settings.hearing.dispatch_period_ms, Some(250));
        assert_eq!(settings.brains.port, 4000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let (_dir, path) = write_settings("{not json");
        assert!(matches!(
            load_with(&path, no_env),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn invalid_merged_value_is_an_error() {
        let (_dir, path) = write_settings(r#"{"websocket": {"maxSendQueue": 0}}"#);
        assert!(matches!(
            load_with(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let (_dir, path) = write_settings(r#"{"brains": {"port": 5000}}"#);
        let env = env_of(&[
            ("BOB_BRAINS_PORT", "6000"),
            ("BOB_BRAINS_TIMEOUT_MS", "2500"),
            ("BOB_LOG_JSON", "yes"),
            ("BOB_CLIENTS_PUBLIC_ADDR", "public:1"),
        ]);
        let settings = load_with(&path, env).unwrap();
        assert_eq!(settings.brains.port, 6000);
        assert_eq!(settings.brains.timeout_ms, 2_500);
        assert!(settings.logging.json);
        assert_eq!(settings.clients.public_addr.as_deref(), Some("public:1"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let env = env_of(&[
            ("BOB_BRAINS_PORT", "99999"),
            ("BOB_LOG_JSON", "maybe"),
            ("BOB_BRAINS_HOST", ""),
        ]);
        let mut settings = BobSettings::default();
        apply_overrides(&mut settings, &env);
        assert_eq!(settings, BobSettings::default());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 100, 1_000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1_000), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
    }

    #[test]
    fn settings_path_under_bob_dir() {
        let path = settings_path();
        assert!(path.ends_with(".bob/settings.json"));
    }
}
