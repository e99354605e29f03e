//! `$VAR` / `${VAR}` expansion for templated configuration values.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{Result, SettingsError};

/// Source of variable values for template expansion.
pub trait VariableResolver: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads variables from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvResolver;

impl VariableResolver for EnvResolver {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed variable table, mostly useful in tests and embedded hosts.
#[derive(Clone, Debug, Default)]
pub struct MapResolver(pub HashMap<String, String>);

impl MapResolver {
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.0.insert(name.into(), value.into());
        self
    }
}

impl VariableResolver for MapResolver {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

fn variable_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").ok())
        .as_ref()
}

/// True when the value contains a variable-substitution marker.
pub fn is_template(value: &str) -> bool {
    value.contains('$')
}

/// Expand every `$VAR` and `${VAR}` in `value`. Unset variables are an error.
pub fn resolve_value(value: &str, resolver: &dyn VariableResolver) -> Result<String> {
    if !is_template(value) {
        return Ok(value.to_string());
    }
    let pattern = variable_pattern()
        .ok_or_else(|| SettingsError::InvalidValue("variable pattern failed to compile".into()))?;
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in pattern.captures_iter(value) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let resolved = resolver
            .get(name.as_str())
            .ok_or_else(|| SettingsError::UnresolvedVariable(name.as_str().to_string()))?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}
