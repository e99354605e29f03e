use async_trait::async_trait;
use loom_core::{AgentError, MessageId, SessionId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Request-scoped values handed to a tool for one step.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    /// Assistant message that issued the tool call.
    pub message_id: MessageId,
    pub model_id: String,
    pub supports_images: bool,
    pub cancel: CancellationToken,
}

/// Output of a tool execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            ..Default::default()
        }
    }

    /// Media result; `data` is base64.
    pub fn media(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            content: "Loaded media content".to_string(),
            data: Some(data.into()),
            mime_type: Some(mime_type.into()),
            ..Default::default()
        }
    }
}

/// Tool definition sent to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each tool.
///
/// Returning `Err(AgentError::PermissionDenied)` or `Err(AgentError::Cancelled)`
/// aborts the run; ordinary failures should come back as
/// [`ToolResponse::error`] so the model can react to them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResponse, AgentError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}
