/// A structured failure reported by a model provider.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{title}: {message}")]
pub struct ProviderError {
    pub title: String,
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

/// Failures reported by the message and session stores.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Error taxonomy for a session run.
///
/// `EmptyPrompt`, `SessionMissing` and `SessionBusy` are validation
/// failures returned before anything is persisted. Everything else can
/// surface after the run has started writing.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("session id is missing")]
    SessionMissing,
    #[error("session is busy")]
    SessionBusy,
    #[error("request canceled by user")]
    Cancelled,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for an HTTP 401 wrapped as a provider error.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_unauthorized())
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyPrompt | Self::SessionMissing | Self::SessionBusy
        )
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "empty_prompt",
            Self::SessionMissing => "session_missing",
            Self::SessionBusy => "session_busy",
            Self::Cancelled => "cancelled",
            Self::PermissionDenied => "permission_denied",
            Self::Provider(_) => "provider",
            Self::Store(_) => "store",
            Self::Auth(_) => "auth",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_only_for_401_provider_errors() {
        let err: AgentError = ProviderError::new("unauthorized", "bad token")
            .with_status(401)
            .into();
        assert!(err.is_unauthorized());

        let forbidden: AgentError = ProviderError::new("forbidden", "nope").with_status(403).into();
        assert!(!forbidden.is_unauthorized());

        assert!(!AgentError::Auth("401".into()).is_unauthorized());
        assert!(!AgentError::Other("401 unauthorized".into()).is_unauthorized());
    }

    #[test]
    fn validation_classification() {
        assert!(AgentError::EmptyPrompt.is_validation());
        assert!(AgentError::SessionMissing.is_validation());
        assert!(AgentError::SessionBusy.is_validation());
        assert!(!AgentError::Cancelled.is_validation());
        assert!(!AgentError::PermissionDenied.is_validation());
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::new("overloaded", "try again later");
        assert_eq!(err.to_string(), "overloaded: try again later");
        let wrapped = AgentError::from(err);
        assert_eq!(wrapped.to_string(), "overloaded: try again later");
        assert_eq!(wrapped.kind(), "provider");
    }

    #[test]
    fn store_error_converts() {
        let err: AgentError = StoreError::NotFound("sess_1".into()).into();
        assert!(matches!(err, AgentError::Store(StoreError::NotFound(_))));
        assert_eq!(err.kind(), "store");
    }
}
