//! The session agent: single-flight run loop per session with a FIFO of
//! pending prompts and a registry of cancellable in-flight generations.

use std::sync::Arc;
use std::time::Duration;

use loom_core::{AgentError, Message, MessageId, Session, SessionAgentCall, SessionId};
use loom_llm::{CallOptions, StepResult, StreamRequest, StreamResult, Tool};
use loom_store::{MessageStore, SessionStore};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::handler::RunHandler;
use crate::history;
use crate::prompts::continuation_prompt;
use crate::recovery;
use crate::registry::{summarize_key, ActiveGuard, ActiveRequests, PromptQueue};
use crate::snapshot::{AgentSnapshot, ModelHandle, SnapshotCell};
use crate::title::TitleJob;

/// Interval between registry checks while waiting for cancelled runs.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound on how long `cancel_all` waits for runs to unwind.
pub const CANCEL_ALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionAgentConfig {
    /// Sub-agents skip the todo reminder.
    pub is_sub_agent: bool,
    pub disable_auto_summarize: bool,
    pub disable_provider_cache: bool,
}

/// Outcome of an executed call.
#[derive(Clone, Debug)]
pub struct AgentResult {
    /// Assistant message of the final step.
    pub message_id: Option<MessageId>,
    pub response: StreamResult,
}

pub struct SessionAgent {
    config: RwLock<SessionAgentConfig>,
    snapshot: SnapshotCell,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) messages: Arc<dyn MessageStore>,
    pub(crate) active: ActiveRequests,
    pub(crate) queue: PromptQueue,
    /// Serializes read-modify-write of session rows between the run loop,
    /// summarization and title generation.
    pub(crate) session_lock: Arc<Mutex<()>>,
}

impl SessionAgent {
    pub fn new(
        config: SessionAgentConfig,
        snapshot: AgentSnapshot,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            snapshot: SnapshotCell::new(snapshot),
            sessions,
            messages,
            active: ActiveRequests::new(),
            queue: PromptQueue::new(),
            session_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> SessionAgentConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: SessionAgentConfig) {
        *self.config.write() = config;
    }

    pub fn snapshot(&self) -> Arc<AgentSnapshot> {
        self.snapshot.load()
    }

    pub fn set_models(&self, large: ModelHandle, small: ModelHandle) {
        self.snapshot.update(|s| {
            s.large = large;
            s.small = small;
        });
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        self.snapshot.update(|s| s.tools = tools);
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.snapshot.update(|s| s.system_prompt = prompt);
    }

    pub fn set_system_prompt_prefix(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        self.snapshot.update(|s| s.system_prompt_prefix = prefix);
    }

    /// Submit a call. Returns `Ok(None)` when the session is busy and the
    /// call was queued; otherwise runs it, then keeps draining the queue and
    /// returns the result of the last call executed.
    ///
    /// Prompts left queued by a failed run are executed first, ahead of
    /// `call`.
    #[instrument(skip_all, fields(session_id = %call.session_id))]
    pub async fn run(&self, call: SessionAgentCall) -> Result<Option<AgentResult>, AgentError> {
        if call.prompt.is_empty() && !call.has_text_attachment() {
            return Err(AgentError::EmptyPrompt);
        }
        if call.session_id.is_empty() {
            return Err(AgentError::SessionMissing);
        }
        let session_id = call.session_id.clone();
        let Some(mut guard) = self.active.try_register(session_id.as_str()) else {
            debug!("session busy, queueing prompt");
            self.queue.push_back(call);
            return Ok(None);
        };
        let mut next = match self.queue.pop_front(&session_id) {
            Some(stranded) => {
                info!(
                    queued = self.queue.len(&session_id) + 1,
                    "running prompts left by a failed run first"
                );
                self.queue.push_back(call);
                stranded
            }
            None => call,
        };

        loop {
            let last = self.run_once(next, guard).await?;
            // Claim before popping so a call is never taken off the queue
            // by a loop that cannot run it.
            loop {
                let Some(claimed) = self.active.try_register(session_id.as_str()) else {
                    // Another run owns the session and its queue now.
                    return Ok(Some(last));
                };
                if let Some(queued) = self.queue.pop_front(&session_id) {
                    debug!(remaining = self.queue.len(&session_id), "draining queued prompt");
                    guard = claimed;
                    next = queued;
                    break;
                }
                drop(claimed);
                if self.queue.len(&session_id) == 0 {
                    return Ok(Some(last));
                }
            }
        }
    }

    async fn run_once(
        &self,
        call: SessionAgentCall,
        guard: ActiveGuard,
    ) -> Result<AgentResult, AgentError> {
        let cancel = guard.token();
        let carried = self.queue.len(&call.session_id);
        let snapshot = self.snapshot.load();
        let config = self.config();

        let session = self.sessions.get(&call.session_id).await?;
        let stored = self.session_messages(&session).await?;
        let title_task = (stored.is_empty() && !config.is_sub_agent).then(|| {
            TitleJob {
                sessions: Arc::clone(&self.sessions),
                model: snapshot.small.clone(),
                session_lock: Arc::clone(&self.session_lock),
                system_prompt_prefix: snapshot.system_prompt_prefix.clone(),
                session_id: call.session_id.clone(),
                prompt: call.prompt.clone(),
            }
            .spawn()
        });

        let _ = self.messages.create(history::user_message(&call)).await?;
        let conversation = history::with_todo_reminder(
            history::assemble_history(&stored),
            &session.todos,
            config.is_sub_agent,
        );
        let (prompt, files) = history::prepare_prompt(&call.prompt, &call.attachments);
        let handler = RunHandler::new(self, &snapshot, config, session, carried, cancel.clone());
        let request = StreamRequest {
            prompt,
            files,
            system_prompt: snapshot.system_prompt.clone(),
            history: conversation,
            tools: snapshot.tools.clone(),
            options: CallOptions {
                sampling: call.sampling.clone(),
                provider_options: call.provider_options.clone(),
            },
            cancel: cancel.clone(),
        };

        let outcome = match snapshot.large.model.stream(request, &handler).await {
            Ok(response) => {
                self.complete_run(&call, &snapshot, &handler, response, &cancel)
                    .await
            }
            Err(err) => {
                warn!(error = %err, kind = err.kind(), "run failed");
                if let Err(store_err) = recovery::finalize_failed_run(
                    self.messages.as_ref(),
                    handler.current_message(),
                    &err,
                    &snapshot.large,
                )
                .await
                {
                    warn!(error = %store_err, "failed to finalize interrupted message");
                }
                Err(err)
            }
        };
        drop(guard);

        if let Some(task) = title_task {
            if let Err(err) = task.await {
                warn!(error = %err, "title task did not complete");
            }
        }
        outcome
    }

    async fn complete_run(
        &self,
        call: &SessionAgentCall,
        snapshot: &AgentSnapshot,
        handler: &RunHandler<'_>,
        response: StreamResult,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, AgentError> {
        let current = handler.current_message();
        if handler.summarize_requested() && !cancel.is_cancelled() {
            info!("context window nearly full, summarizing session");
            self.summarize_session(&call.session_id, call.provider_options.clone(), snapshot)
                .await?;
            let interrupted = current.as_ref().is_some_and(|m| !m.tool_calls().is_empty());
            if interrupted && !cancel.is_cancelled() {
                debug!("queueing continuation after summarization");
                self.queue.push_back(SessionAgentCall {
                    prompt: continuation_prompt(&call.prompt),
                    ..call.clone()
                });
            }
        }
        Ok(AgentResult {
            message_id: current.map(|m| m.id),
            response,
        })
    }

    /// Stored messages as the model should see them: truncated at the
    /// summary message when the session has one.
    pub(crate) async fn session_messages(&self, session: &Session) -> Result<Vec<Message>, AgentError> {
        let messages = self.messages.list(&session.id).await?;
        Ok(history::truncate_at_summary(
            messages,
            session.summary_message_id.as_ref(),
        ))
    }

    pub async fn get_session_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, AgentError> {
        let session = self.sessions.get(session_id).await?;
        self.session_messages(&session).await
    }

    /// Cancel the session's generation and summarization and drop its queue.
    pub fn cancel(&self, session_id: &SessionId) {
        if self.active.cancel(session_id.as_str()) {
            info!(session_id = %session_id, "request cancelled");
        }
        if self.active.cancel(&summarize_key(session_id)) {
            info!(session_id = %session_id, "summarization cancelled");
        }
        let queued = self.queue.len(session_id);
        if queued > 0 {
            debug!(session_id = %session_id, queued, "clearing queued prompts");
            self.queue.clear(session_id);
        }
    }

    /// Cancel everything and wait (bounded) for the registry to drain.
    pub async fn cancel_all(&self) {
        if self.active.is_empty() {
            return;
        }
        for key in self.active.keys() {
            let _ = self.active.cancel(&key);
        }
        self.queue.clear_all();

        let deadline = Instant::now() + CANCEL_ALL_TIMEOUT;
        while !self.active.is_empty() {
            if Instant::now() >= deadline {
                warn!(remaining = self.active.len(), "timed out waiting for cancelled runs");
                return;
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn is_session_busy(&self, session_id: &SessionId) -> bool {
        self.active.contains(session_id.as_str())
    }

    pub fn is_summarizing(&self, session_id: &SessionId) -> bool {
        self.active.contains(&summarize_key(session_id))
    }

    pub fn queued_prompts(&self, session_id: &SessionId) -> usize {
        self.queue.len(session_id)
    }

    pub fn queued_prompt_texts(&self, session_id: &SessionId) -> Vec<String> {
        self.queue.prompts(session_id)
    }

    pub fn clear_queue(&self, session_id: &SessionId) {
        self.queue.clear(session_id);
    }
}

/// Provider-billed amount across steps, if any step reported one.
pub(crate) fn billed_total(steps: &[StepResult]) -> Option<f64> {
    steps
        .iter()
        .filter_map(|s| s.billed_cost)
        .reduce(|a, b| a + b)
}
