//! Automatic and on-demand summarization of a session's history.

use async_trait::async_trait;
use loom_core::{AgentError, FinishReason, Message, ProviderOptions, SessionId};
use loom_llm::{CallOptions, ModelMessage, PreparedStep, StepHandler, StreamRequest, ToolContext};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{billed_total, SessionAgent};
use crate::history;
use crate::prompts::{summary_prompt, SUMMARY_SYSTEM_PROMPT};
use crate::registry::summarize_key;
use crate::snapshot::AgentSnapshot;

/// Context windows above this size keep a fixed headroom.
pub const LARGE_CONTEXT_WINDOW: u64 = 200_000;
pub const LARGE_CONTEXT_BUFFER: u64 = 20_000;

/// Headroom that must remain before a run is cut short for summarization.
pub fn summarization_buffer(context_window: u64) -> u64 {
    if context_window > LARGE_CONTEXT_WINDOW {
        LARGE_CONTEXT_BUFFER
    } else {
        context_window / 5
    }
}

/// True once the remaining context is at or below the buffer. An unknown
/// (zero) context window never triggers.
pub fn should_summarize(context_window: u64, used_tokens: u64) -> bool {
    if context_window == 0 {
        return false;
    }
    context_window.saturating_sub(used_tokens) <= summarization_buffer(context_window)
}

impl SessionAgent {
    /// Summarize a session on demand. Fails with `SessionBusy` while the
    /// session has a run in flight.
    #[instrument(skip(self, provider_options), fields(session_id = %session_id))]
    pub async fn summarize(
        &self,
        session_id: &SessionId,
        provider_options: ProviderOptions,
    ) -> Result<(), AgentError> {
        if session_id.is_empty() {
            return Err(AgentError::SessionMissing);
        }
        if self.is_session_busy(session_id) {
            return Err(AgentError::SessionBusy);
        }
        let snapshot = self.snapshot();
        self.summarize_session(session_id, provider_options, &snapshot)
            .await
    }

    pub(crate) async fn summarize_session(
        &self,
        session_id: &SessionId,
        provider_options: ProviderOptions,
        snapshot: &AgentSnapshot,
    ) -> Result<(), AgentError> {
        let Some(guard) = self.active.try_register(&summarize_key(session_id)) else {
            return Err(AgentError::SessionBusy);
        };
        let cancel = guard.token();

        let session = self.sessions.get(session_id).await?;
        let stored = self.session_messages(&session).await?;
        if stored.is_empty() {
            debug!("nothing to summarize");
            return Ok(());
        }
        info!(messages = stored.len(), "summarization started");

        let model = &snapshot.large;
        let info = model.info();
        let mut summary = Message::assistant(session_id.clone(), info.id.clone(), info.provider.clone());
        summary.is_summary_message = true;
        let summary = self.messages.create(summary).await?;
        let summary_id = summary.id.clone();

        let handler = SummaryHandler {
            agent: self,
            message: Mutex::new(summary),
            prefix: &snapshot.system_prompt_prefix,
            model_id: info.id.clone(),
            supports_images: info.supports_images,
            cancel: cancel.clone(),
        };
        let request = StreamRequest {
            prompt: summary_prompt(&session.todos),
            files: Vec::new(),
            system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
            history: history::assemble_history(&stored),
            tools: Vec::new(),
            options: CallOptions {
                sampling: model.options.sampling.clone(),
                provider_options,
            },
            cancel,
        };

        let response = match model.model.stream(request, &handler).await {
            Ok(response) => response,
            Err(err) if err.is_cancelled() => {
                info!("summarization cancelled, discarding partial summary");
                return self
                    .messages
                    .delete(&summary_id)
                    .await
                    .map_err(AgentError::from);
            }
            Err(err) => {
                warn!(error = %err, "summarization failed");
                return Err(err);
            }
        };

        let mut summary = handler.into_message();
        summary.set_finish(FinishReason::EndTurn, None, None);
        self.messages.update(&summary).await?;

        let usage = response.total_usage;
        let cost = info
            .cost
            .cost_with_override(&usage, billed_total(&response.steps));
        let _lock = self.session_lock.lock().await;
        let mut session = self.sessions.get(session_id).await?;
        session.summary_message_id = Some(summary_id);
        session.completion_tokens = usage.output_tokens;
        session.prompt_tokens = 0;
        session.cost += cost;
        let _ = self.sessions.save(&session).await?;
        info!(output_tokens = usage.output_tokens, "summarization finished");
        Ok(())
    }
}

/// Streams the summary into its own message.
struct SummaryHandler<'a> {
    agent: &'a SessionAgent,
    message: Mutex<Message>,
    prefix: &'a str,
    model_id: String,
    supports_images: bool,
    cancel: CancellationToken,
}

impl SummaryHandler<'_> {
    fn into_message(self) -> Message {
        self.message.into_inner()
    }

    async fn save(&self, edit: impl FnOnce(&mut Message) + Send) -> Result<(), AgentError> {
        let updated = {
            let mut message = self.message.lock();
            edit(&mut *message);
            message.clone()
        };
        self.agent.messages.update(&updated).await?;
        Ok(())
    }
}

#[async_trait]
impl StepHandler for SummaryHandler<'_> {
    async fn prepare_step(
        &self,
        _step: usize,
        mut messages: Vec<ModelMessage>,
    ) -> Result<PreparedStep, AgentError> {
        if !self.prefix.is_empty() {
            messages.insert(0, ModelMessage::system(self.prefix));
        }
        let (session_id, message_id) = {
            let message = self.message.lock();
            (message.session_id.clone(), message.id.clone())
        };
        Ok(PreparedStep {
            messages,
            context: ToolContext {
                session_id,
                message_id,
                model_id: self.model_id.clone(),
                supports_images: self.supports_images,
                cancel: self.cancel.clone(),
            },
        })
    }

    async fn on_reasoning_start(&self, _id: &str) -> Result<(), AgentError> {
        self.save(|m| m.start_reasoning()).await
    }

    async fn on_reasoning_delta(&self, _id: &str, text: &str) -> Result<(), AgentError> {
        self.save(|m| m.append_reasoning(text)).await
    }

    async fn on_reasoning_end(&self, _id: &str, signature: Option<String>) -> Result<(), AgentError> {
        self.save(|m| m.finish_reasoning(signature)).await
    }

    async fn on_text_delta(&self, _id: &str, text: &str) -> Result<(), AgentError> {
        self.save(|m| m.append_text(text)).await
    }
}
