//! Contract between the session agent and a model runtime.
//!
//! A runtime drives one or more generation steps for a request. Before
//! each step it calls [`StepHandler::prepare_step`] so the caller can
//! rewrite the outgoing messages and supply the [`ToolContext`]; while the
//! step streams it reports incremental events; after the step it reports
//! usage and asks [`StepHandler::should_stop`] whether to end early.
//!
//! `prepare_step` always receives the runtime's own conversation (initial
//! messages plus the assistant and tool turns produced so far). What it
//! returns is sent for that step only.

use std::sync::Arc;

use async_trait::async_trait;
use loom_core::{AgentError, FinishReason, ProviderOptions, SamplingOptions, Usage};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::ModelInfo;
use crate::prompt::{FilePart, ModelMessage};
use crate::tools::{Tool, ToolContext, ToolResponse};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    pub sampling: SamplingOptions,
    pub provider_options: ProviderOptions,
}

pub struct StreamRequest {
    pub prompt: String,
    pub files: Vec<FilePart>,
    pub system_prompt: String,
    pub history: Vec<ModelMessage>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub options: CallOptions,
    pub cancel: CancellationToken,
}

impl StreamRequest {
    /// Messages for the first step: system prompt, history, then the prompt.
    pub fn initial_messages(&self) -> Vec<ModelMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(ModelMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.history.iter().cloned());
        if !self.prompt.is_empty() || !self.files.is_empty() {
            messages.push(ModelMessage::user_with_files(
                self.prompt.clone(),
                self.files.clone(),
            ));
        }
        messages
    }
}

/// What `prepare_step` hands back to the runtime.
pub struct PreparedStep {
    pub messages: Vec<ModelMessage>,
    pub context: ToolContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
    Unknown,
}

impl ProviderFinishReason {
    pub fn to_finish_reason(self) -> FinishReason {
        match self {
            Self::Length => FinishReason::MaxTokens,
            Self::Stop => FinishReason::EndTurn,
            Self::ToolCalls => FinishReason::ToolUse,
            _ => FinishReason::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub finish_reason: ProviderFinishReason,
    pub usage: Usage,
    /// Amount billed by the provider, when it reports one.
    pub billed_cost: Option<f64>,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub text: String,
    pub steps: Vec<StepResult>,
    pub total_usage: Usage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub id: String,
    pub name: String,
    pub input: String,
    pub provider_executed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub tool_call_id: String,
    pub name: String,
    pub response: ToolResponse,
}

/// Callbacks invoked by the runtime, in arrival order, from a single task.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn prepare_step(
        &self,
        step: usize,
        messages: Vec<ModelMessage>,
    ) -> Result<PreparedStep, AgentError>;

    async fn on_reasoning_start(&self, _id: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_reasoning_delta(&self, _id: &str, _text: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_reasoning_end(&self, _id: &str, _signature: Option<String>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_text_delta(&self, _id: &str, _text: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_tool_input_start(&self, _id: &str, _name: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_tool_call(&self, _call: &ToolCallEvent) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_tool_result(&self, _result: &ToolResultEvent) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_step_finish(&self, _step: &StepResult) -> Result<(), AgentError> {
        Ok(())
    }

    /// Evaluated after every step; `true` ends the stream early.
    fn should_stop(&self, _step: &StepResult) -> bool {
        false
    }
}

/// A model runtime bound to one provider model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn info(&self) -> &ModelInfo;

    async fn stream(
        &self,
        request: StreamRequest,
        handler: &dyn StepHandler,
    ) -> Result<StreamResult, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ModelRole;

    #[test]
    fn finish_reason_maps_to_closed_set() {
        assert_eq!(ProviderFinishReason::Length.to_finish_reason(), FinishReason::MaxTokens);
        assert_eq!(ProviderFinishReason::Stop.to_finish_reason(), FinishReason::EndTurn);
        assert_eq!(ProviderFinishReason::ToolCalls.to_finish_reason(), FinishReason::ToolUse);
        assert_eq!(ProviderFinishReason::ContentFilter.to_finish_reason(), FinishReason::Unknown);
        assert_eq!(ProviderFinishReason::Other.to_finish_reason(), FinishReason::Unknown);
    }

    #[test]
    fn initial_messages_order() {
        let request = StreamRequest {
            prompt: "hi".into(),
            files: Vec::new(),
            system_prompt: "be brief".into(),
            history: vec![ModelMessage::user("earlier")],
            tools: Vec::new(),
            options: CallOptions::default(),
            cancel: CancellationToken::new(),
        };
        let messages = request.initial_messages();
        let roles: Vec<ModelRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ModelRole::System, ModelRole::User, ModelRole::User]);
        assert_eq!(messages[2].text(), "hi");
    }

    #[test]
    fn empty_prompt_adds_no_user_turn() {
        let request = StreamRequest {
            prompt: String::new(),
            files: Vec::new(),
            system_prompt: String::new(),
            history: vec![ModelMessage::user("seed")],
            tools: Vec::new(),
            options: CallOptions::default(),
            cancel: CancellationToken::new(),
        };
        assert_eq!(request.initial_messages().len(), 1);
    }
}
