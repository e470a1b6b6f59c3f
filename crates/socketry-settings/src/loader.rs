//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SocketrySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SOCKETRY_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::SocketrySettings;

/// Bind address override.
pub const ENV_HOST: &str = "SOCKETRY_HOST";
/// Bind port override.
pub const ENV_PORT: &str = "SOCKETRY_PORT";
/// Maximum message size override.
pub const ENV_MAX_MESSAGE_SIZE: &str = "SOCKETRY_MAX_MESSAGE_SIZE";
/// Heartbeat interval override (milliseconds).
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "SOCKETRY_HEARTBEAT_INTERVAL_MS";
/// Heartbeat miss tolerance override.
pub const ENV_HEARTBEAT_TRY_TIMES: &str = "SOCKETRY_HEARTBEAT_TRY_TIMES";

/// Resolve the default settings path (`~/.socketry/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".socketry").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SocketrySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<SocketrySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<SocketrySettings> {
    let parse_error = |source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(SocketrySettings::default()).map_err(parse_error)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(parse_error)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(parse_error)
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

/// Apply `SOCKETRY_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut SocketrySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are logged and ignored (falling back to file/default).
pub fn apply_overrides(settings: &mut SocketrySettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup(ENV_HOST).filter(|v| !v.is_empty()) {
        settings.server.host = v;
    }
    if let Some(v) = read_number(&lookup, ENV_PORT, 0, u64::from(u16::MAX)) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = read_number(&lookup, ENV_MAX_MESSAGE_SIZE, 1, 1 << 30) {
        settings.server.max_message_size = usize::try_from(v).unwrap_or(settings.server.max_message_size);
    }
    if let Some(v) = read_number(&lookup, ENV_HEARTBEAT_INTERVAL_MS, 1, 3_600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = read_number(&lookup, ENV_HEARTBEAT_TRY_TIMES, 1, 1_000) {
        settings.heartbeat.try_times = u32::try_from(v).unwrap_or(settings.heartbeat.try_times);
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_number(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    min: u64,
    max: u64,
) -> Option<u64> {
    let val = lookup(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}
