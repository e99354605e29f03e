//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{SelectedModel, Settings};

/// Resolve the path to the settings file (`~/.loom/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".loom").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_overrides_from(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Write settings back to disk, creating parent directories as needed.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)?;
    Ok(())
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

/// Apply `LOOM_*` overrides using `lookup` to read variables.
///
/// Invalid values are ignored with a warning and the file/default value wins.
pub fn apply_overrides_from<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let read_bool = |name: &str| {
        let val = read(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    };

    if let Some(v) = read("LOOM_LARGE_MODEL") {
        apply_model_override(&mut settings.models.large, &v);
    }
    if let Some(v) = read("LOOM_SMALL_MODEL") {
        apply_model_override(&mut settings.models.small, &v);
    }
    if let Some(v) = read_bool("LOOM_DISABLE_AUTO_SUMMARIZE") {
        settings.options.disable_auto_summarize = v;
    }
    if let Some(v) = read_bool("LOOM_DISABLE_PROVIDER_CACHE") {
        settings.options.disable_provider_cache = v;
    }
    if let Some(v) = read("LOOM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_bool("LOOM_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// `provider/model` switches both; a bare name only switches the model.
fn apply_model_override(selected: &mut SelectedModel, value: &str) {
    match value.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            selected.provider = provider.to_string();
            selected.model = model.to_string();
        }
        _ => selected.model = value.to_string(),
    }
}

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
