//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HubmeshSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `HUBMESH_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{HubmeshSettings, LogLevel, MIN_IDLE_AUTO_DELETE_SECS};

/// Resolve the path to the settings file (`~/.hubmesh/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".hubmesh").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HubmeshSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HubmeshSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<HubmeshSettings> {
    let schema_err = |source| SettingsError::Parse { path: None, source };
    let defaults = serde_json::to_value(HubmeshSettings::default()).map_err(schema_err)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HubmeshSettings = serde_json::from_value(merged).map_err(schema_err)?;
    apply_overrides(&mut settings, env);
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

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut HubmeshSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Invalid values are logged and ignored, keeping the file/default value.
fn apply_overrides(settings: &mut HubmeshSettings, env: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| env(name).filter(|v| !v.is_empty());
    let parsed = |name: &str, kind: &str, parse: &dyn Fn(&str) -> Option<u64>| {
        let val = env(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    };

    // ── Backplane ───────────────────────────────────────────────────
    if let Some(v) = string("HUBMESH_CONNECTION_STRING") {
        settings.backplane.connection_string = v;
    }
    if let Some(v) = string("HUBMESH_TOPIC") {
        settings.backplane.topic_name = v;
    }
    if let Some(v) = parsed("HUBMESH_IDLE_AUTO_DELETE_SECS", "u64", &|s| {
        parse_u64_range(s, MIN_IDLE_AUTO_DELETE_SECS, u64::MAX)
    }) {
        settings.backplane.idle_auto_delete_secs = v;
    }
    if let Some(v) = parsed("HUBMESH_MESSAGE_TTL_SECS", "u64", &|s| {
        parse_u64_range(s, 1, u64::MAX)
    }) {
        settings.backplane.message_ttl_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(val) = env("HUBMESH_LOG_LEVEL") {
        match LogLevel::parse(&val) {
            Some(level) => settings.logging.level = level,
            None => tracing::warn!(key = "HUBMESH_LOG_LEVEL", value = %val, "invalid log level, ignoring"),
        }
    }
    if let Some(val) = env("HUBMESH_LOG_JSON") {
        match parse_bool(&val) {
            Some(json) => settings.logging.json = json,
            None => tracing::warn!(key = "HUBMESH_LOG_JSON", value = %val, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
