use async_trait::async_trait;
use loom_core::message::{ToolCall, ToolResult};
use loom_core::{AgentError, Message, Session, SessionId};
use loom_llm::{
    IntoModelMessages, ModelMessage, PreparedStep, StepHandler, StepResult, ToolCallEvent,
    ToolContext, ToolResultEvent,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{SessionAgent, SessionAgentConfig};
use crate::history;
use crate::snapshot::AgentSnapshot;
use crate::summarize::should_summarize;

struct RunState {
    /// Assistant message of the current step.
    current: Option<Message>,
    text_started: bool,
    session: Session,
    summarize: bool,
}

/// Persists a run's streamed output and keeps session accounting current.
pub(crate) struct RunHandler<'a> {
    agent: &'a SessionAgent,
    snapshot: &'a AgentSnapshot,
    config: SessionAgentConfig,
    session_id: SessionId,
    /// Calls already queued when the run started; they run after it.
    carried: usize,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

impl<'a> RunHandler<'a> {
    pub(crate) fn new(
        agent: &'a SessionAgent,
        snapshot: &'a AgentSnapshot,
        config: SessionAgentConfig,
        session: Session,
        carried: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            snapshot,
            config,
            session_id: session.id.clone(),
            carried,
            cancel,
            state: Mutex::new(RunState {
                current: None,
                text_started: false,
                session,
                summarize: false,
            }),
        }
    }

    pub(crate) fn current_message(&self) -> Option<Message> {
        self.state.lock().current.clone()
    }

    pub(crate) fn summarize_requested(&self) -> bool {
        self.state.lock().summarize
    }

    fn edit_current(&self, edit: impl FnOnce(&mut Message)) -> Option<Message> {
        let mut state = self.state.lock();
        let message = state.current.as_mut()?;
        edit(message);
        Some(message.clone())
    }

    async fn save_current(&self, edit: impl FnOnce(&mut Message) + Send) -> Result<(), AgentError> {
        if let Some(message) = self.edit_current(edit) {
            self.agent.messages.update(&message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StepHandler for RunHandler<'_> {
    async fn prepare_step(
        &self,
        step: usize,
        mut messages: Vec<ModelMessage>,
    ) -> Result<PreparedStep, AgentError> {
        for message in &mut messages {
            message.provider_options.clear();
        }

        for queued in self.agent.queue.take_after(&self.session_id, self.carried) {
            debug!(step, "folding queued prompt into running step");
            let stored = self
                .agent
                .messages
                .create(history::user_message(&queued))
                .await?;
            messages.extend(stored.to_model_messages());
        }

        let large = &self.snapshot.large;
        if !large.provider_kind.supports_media_in_tool_results() {
            messages = history::rewrite_media_tool_results(messages);
        }
        if !self.config.disable_provider_cache {
            history::apply_cache_hints(&mut messages);
        }
        if !self.snapshot.system_prompt_prefix.is_empty() {
            messages.insert(0, ModelMessage::system(self.snapshot.system_prompt_prefix.clone()));
        }

        let info = large.info();
        let assistant = self
            .agent
            .messages
            .create(Message::assistant(
                self.session_id.clone(),
                info.id.clone(),
                info.provider.clone(),
            ))
            .await?;
        let message_id = assistant.id.clone();
        {
            let mut state = self.state.lock();
            state.current = Some(assistant);
            state.text_started = false;
        }

        Ok(PreparedStep {
            messages,
            context: ToolContext {
                session_id: self.session_id.clone(),
                message_id,
                model_id: info.id.clone(),
                supports_images: info.supports_images,
                cancel: self.cancel.clone(),
            },
        })
    }

    async fn on_reasoning_start(&self, _id: &str) -> Result<(), AgentError> {
        self.save_current(|m| m.start_reasoning()).await
    }

    async fn on_reasoning_delta(&self, _id: &str, text: &str) -> Result<(), AgentError> {
        self.save_current(|m| m.append_reasoning(text)).await
    }

    async fn on_reasoning_end(&self, _id: &str, signature: Option<String>) -> Result<(), AgentError> {
        self.save_current(|m| m.finish_reasoning(signature)).await
    }

    async fn on_text_delta(&self, _id: &str, text: &str) -> Result<(), AgentError> {
        let updated = {
            let mut state = self.state.lock();
            let first = !state.text_started;
            state.text_started = true;
            state.current.as_mut().map(|message| {
                let delta = if first {
                    text.strip_prefix('\n').unwrap_or(text)
                } else {
                    text
                };
                message.append_text(delta);
                message.clone()
            })
        };
        if let Some(message) = updated {
            self.agent.messages.update(&message).await?;
        }
        Ok(())
    }

    async fn on_tool_input_start(&self, id: &str, name: &str) -> Result<(), AgentError> {
        self.save_current(|m| {
            m.upsert_tool_call(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input: String::new(),
                finished: false,
                provider_executed: false,
            })
        })
        .await
    }

    async fn on_tool_call(&self, call: &ToolCallEvent) -> Result<(), AgentError> {
        self.save_current(|m| {
            m.upsert_tool_call(ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
                finished: true,
                provider_executed: call.provider_executed,
            })
        })
        .await
    }

    async fn on_tool_result(&self, result: &ToolResultEvent) -> Result<(), AgentError> {
        let response = &result.response;
        let stored = ToolResult {
            tool_call_id: result.tool_call_id.clone(),
            name: result.name.clone(),
            content: response.content.clone(),
            data: response.data.clone(),
            mime_type: response.mime_type.clone(),
            metadata: response.metadata.clone(),
            is_error: response.is_error,
        };
        let _ = self
            .agent
            .messages
            .create(Message::tool_results(self.session_id.clone(), vec![stored]))
            .await?;
        Ok(())
    }

    async fn on_step_finish(&self, step: &StepResult) -> Result<(), AgentError> {
        let reason = step.finish_reason.to_finish_reason();
        self.save_current(|m| m.set_finish(reason, None, None)).await?;

        let cost = self
            .snapshot
            .large
            .info()
            .cost
            .cost_with_override(&step.usage, step.billed_cost);
        let _lock = self.agent.session_lock.lock().await;
        let mut session = self.agent.sessions.get(&self.session_id).await?;
        session.prompt_tokens = step.usage.prompt_tokens();
        session.completion_tokens = step.usage.completion_tokens();
        session.cost += cost;
        let saved = self.agent.sessions.save(&session).await?;
        self.state.lock().session = saved;
        Ok(())
    }

    fn should_stop(&self, _step: &StepResult) -> bool {
        if self.config.disable_auto_summarize {
            return false;
        }
        let context_window = self.snapshot.large.info().context_window;
        let mut state = self.state.lock();
        if should_summarize(context_window, state.session.context_tokens()) {
            state.summarize = true;
            return true;
        }
        false
    }
}
