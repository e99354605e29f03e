//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_core::{AgentError, Message, Role, Session, SessionAgentCall, SessionId};
use loom_llm::mock::{MockModel, MockResponse};
use loom_llm::{Tool, ToolContext, ToolResponse};
use loom_runtime::permission::{CreatePermissionRequest, PermissionGate};
use loom_runtime::{AgentSnapshot, ModelHandle, SessionAgent, SessionAgentConfig};
use loom_settings::ProviderKind;
use loom_store::{InMemoryMessageStore, InMemorySessionStore, MessageStore, SessionStore};
use loom_telemetry::TelemetryConfig;
use serde_json::{json, Value};
use tokio::sync::Notify;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = loom_telemetry::init_logging(&TelemetryConfig {
        level: "warn".to_string(),
        module_levels: vec![("loom_runtime".to_string(), "debug".to_string())],
        json: false,
    });
}

pub struct Harness {
    pub agent: Arc<SessionAgent>,
    pub large: Arc<MockModel>,
    pub small: Arc<MockModel>,
    pub sessions: Arc<InMemorySessionStore>,
    pub messages: Arc<InMemoryMessageStore>,
}

impl Harness {
    pub fn new(large: MockModel, small: MockModel) -> Self {
        Self::with_config(large, small, SessionAgentConfig::default(), Vec::new())
    }

    pub fn with_config(
        large: MockModel,
        small: MockModel,
        config: SessionAgentConfig,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        init_tracing();
        let large = Arc::new(large);
        let small = Arc::new(small);
        let sessions = Arc::new(InMemorySessionStore::new());
        let messages = Arc::new(InMemoryMessageStore::new());
        let snapshot = AgentSnapshot::new(
            ModelHandle::new(large.clone(), ProviderKind::Anthropic),
            ModelHandle::new(small.clone(), ProviderKind::Anthropic),
        )
        .with_tools(tools)
        .with_system_prompt("You are a coding agent.");
        let agent = Arc::new(SessionAgent::new(
            config,
            snapshot,
            sessions.clone(),
            messages.clone(),
        ));
        Self {
            agent,
            large,
            small,
            sessions,
            messages,
        }
    }

    pub async fn new_session(&self) -> SessionId {
        self.sessions
            .create(Session::new("Untitled Session"))
            .await
            .unwrap()
            .id
    }

    pub async fn session(&self, id: &SessionId) -> Session {
        self.sessions.get(id).await.unwrap()
    }

    pub async fn stored(&self, id: &SessionId) -> Vec<Message> {
        self.messages.list(id).await.unwrap()
    }

    /// Submit `prompt` on a background task.
    pub fn spawn_run(
        &self,
        session_id: &SessionId,
        prompt: &str,
    ) -> tokio::task::JoinHandle<Result<Option<loom_runtime::AgentResult>, AgentError>> {
        let agent = self.agent.clone();
        let call = SessionAgentCall::new(session_id.clone(), prompt);
        tokio::spawn(async move { agent.run(call).await })
    }

    /// Wait until an assistant message in the session contains `text`.
    pub async fn wait_for_text(&self, session_id: &SessionId, text: &str) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let found = self
                    .stored(session_id)
                    .await
                    .iter()
                    .any(|m| m.role == Role::Assistant && m.text().contains(text));
                if found {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("assistant text never appeared");
    }
}

/// A small model with nothing scripted: title generation falls back to
/// the default title.
pub fn idle_small() -> MockModel {
    MockModel::with_context_window(100_000, Vec::new())
}

pub fn large_with(context_window: u64, responses: Vec<MockResponse>) -> MockModel {
    MockModel::with_context_window(context_window, responses)
}

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the `say` field"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"say": {"type": "string"}}})
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolResponse, AgentError> {
        Ok(ToolResponse::text(input["say"].as_str().unwrap_or("echo")))
    }
}

/// Signals `started`, then waits for the run to be cancelled.
pub struct BlockingTool {
    pub started: Arc<Notify>,
}

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Runs until cancelled"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, ctx: &ToolContext) -> Result<ToolResponse, AgentError> {
        self.started.notify_one();
        ctx.cancel.cancelled().await;
        Err(AgentError::Cancelled)
    }
}

/// Ignores cancellation and sleeps for a minute.
pub struct StubbornTool {
    pub started: Arc<Notify>,
}

#[async_trait]
impl Tool for StubbornTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps without checking for cancellation"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, _ctx: &ToolContext) -> Result<ToolResponse, AgentError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ToolResponse::text("woke up"))
    }
}

/// Asks the permission gate before "writing".
pub struct WriteTool {
    pub gate: Arc<dyn PermissionGate>,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Writes a file after asking for permission"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}})
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolResponse, AgentError> {
        let path = input["path"].as_str().unwrap_or_default().to_string();
        self.gate
            .require(
                CreatePermissionRequest {
                    session_id: ctx.session_id.clone(),
                    tool_name: "write".to_string(),
                    action: "write".to_string(),
                    description: format!("Write {path}"),
                    path,
                    ..Default::default()
                },
                &ctx.cancel,
            )
            .await?;
        Ok(ToolResponse::text("written"))
    }
}
