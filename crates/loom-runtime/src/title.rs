use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use loom_core::{AgentError, MessageId, SessionId, Usage};
use loom_llm::{CallOptions, ModelMessage, PreparedStep, StepHandler, StreamRequest, ToolContext};
use loom_store::SessionStore;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agent::billed_total;
use crate::prompts::{title_prompt, DEFAULT_TITLE, MAX_TITLE_CHARS, TITLE_SYSTEM_PROMPT};
use crate::snapshot::ModelHandle;

const TITLE_MAX_OUTPUT_TOKENS: u64 = 40;

/// Background title generation for a session's first prompt.
pub(crate) struct TitleJob {
    pub sessions: Arc<dyn SessionStore>,
    pub model: ModelHandle,
    pub session_lock: Arc<Mutex<()>>,
    pub system_prompt_prefix: String,
    pub session_id: SessionId,
    pub prompt: String,
}

impl TitleJob {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip_all, fields(session_id = %self.session_id))]
    async fn run(self) {
        let (title, usage, cost) = match self.generate().await {
            Ok(generated) => generated,
            Err(err) => {
                warn!(error = %err, "title generation failed");
                (DEFAULT_TITLE.to_string(), Usage::default(), 0.0)
            }
        };
        debug!(title = %title, "session titled");
        let _lock = self.session_lock.lock().await;
        if let Err(err) = self
            .sessions
            .update_title_and_usage(
                &self.session_id,
                &title,
                usage.prompt_tokens(),
                usage.completion_tokens(),
                cost,
            )
            .await
        {
            warn!(error = %err, "failed to store session title");
        }
    }

    async fn generate(&self) -> Result<(String, Usage, f64), AgentError> {
        let info = self.model.info();
        let handler = TitleHandler {
            session_id: self.session_id.clone(),
            prefix: &self.system_prompt_prefix,
            model_id: info.id.clone(),
        };
        let mut sampling = self.model.options.sampling.clone();
        sampling.max_output_tokens = Some(TITLE_MAX_OUTPUT_TOKENS);
        let request = StreamRequest {
            prompt: title_prompt(&self.prompt),
            files: Vec::new(),
            system_prompt: TITLE_SYSTEM_PROMPT.to_string(),
            history: Vec::new(),
            tools: Vec::new(),
            options: CallOptions {
                sampling,
                provider_options: self.model.options.provider_options.clone(),
            },
            cancel: CancellationToken::new(),
        };
        let response = self.model.model.stream(request, &handler).await?;
        let cost = info
            .cost
            .cost_with_override(&response.total_usage, billed_total(&response.steps));
        Ok((clean_title(&response.text), response.total_usage, cost))
    }
}

struct TitleHandler<'a> {
    session_id: SessionId,
    prefix: &'a str,
    model_id: String,
}

#[async_trait]
impl StepHandler for TitleHandler<'_> {
    async fn prepare_step(
        &self,
        _step: usize,
        mut messages: Vec<ModelMessage>,
    ) -> Result<PreparedStep, AgentError> {
        if !self.prefix.is_empty() {
            messages.insert(0, ModelMessage::system(self.prefix));
        }
        Ok(PreparedStep {
            messages,
            context: ToolContext {
                session_id: self.session_id.clone(),
                message_id: MessageId::new(),
                model_id: self.model_id.clone(),
                supports_images: false,
                cancel: CancellationToken::new(),
            },
        })
    }
}

fn think_block() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").ok())
        .as_ref()
}

/// First non-empty line of the model output with reasoning blocks removed,
/// capped at [`MAX_TITLE_CHARS`].
pub fn clean_title(raw: &str) -> String {
    let stripped = match think_block() {
        Some(re) => re.replace_all(raw, ""),
        None => Cow::Borrowed(raw),
    };
    let line = stripped
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let title: String = line.chars().take(MAX_TITLE_CHARS).collect();
    let title = title.trim();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.to_string()
    }
}
