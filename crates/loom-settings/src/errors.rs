use thiserror::Error;

/// Errors that can occur when loading, saving or resolving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
    #[error("variable ${0} is not set")]
    UnresolvedVariable(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
