//! # loom-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`Settings::default()`])
//! 2. **User file**: `~/.loom/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `LOOM_*` overrides (highest priority)
//!
//! API keys may be templates such as `$ANTHROPIC_API_KEY`; they are expanded
//! at model construction time through [`resolve_value`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod resolve;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides_from, deep_merge, load_settings, load_settings_from_path, parse_bool,
    save_settings, settings_path,
};
pub use resolve::{is_template, resolve_value, EnvResolver, MapResolver, VariableResolver};
pub use types::*;
