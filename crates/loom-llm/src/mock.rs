//! Scripted model runtime for deterministic tests without API calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_core::{AgentError, Usage};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::ModelInfo;
use crate::prompt::{ModelMessage, ModelPart, ModelRole, ToolOutput};
use crate::runtime::{
    CallOptions, LanguageModel, ProviderFinishReason, StepHandler, StepResult, StreamRequest,
    StreamResult, ToolCallEvent, ToolResultEvent,
};
use crate::tools::ToolResponse;

/// One streamed event within a scripted step.
#[derive(Clone)]
pub enum MockEvent {
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    Text(String),
    /// The mock executes the named tool from the request's tool list.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Park until the notify fires or the request is cancelled.
    Wait(Arc<Notify>),
    /// Park until the request is cancelled.
    Hang,
}

#[derive(Clone)]
pub struct MockStep {
    pub events: Vec<MockEvent>,
    pub finish: ProviderFinishReason,
    pub usage: Usage,
    pub billed_cost: Option<f64>,
}

impl MockStep {
    pub fn text(text: &str) -> Self {
        Self {
            events: vec![MockEvent::Text(text.to_string())],
            finish: ProviderFinishReason::Stop,
            usage: Usage::default(),
            billed_cost: None,
        }
    }

    pub fn tool_call(id: &str, name: &str, input: serde_json::Value) -> Self {
        Self {
            events: vec![MockEvent::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            finish: ProviderFinishReason::ToolCalls,
            usage: Usage::default(),
            billed_cost: None,
        }
    }

    pub fn events(events: Vec<MockEvent>, finish: ProviderFinishReason) -> Self {
        Self {
            events,
            finish,
            usage: Usage::default(),
            billed_cost: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_billed_cost(mut self, cost: f64) -> Self {
        self.billed_cost = Some(cost);
        self
    }
}

/// Pre-programmed response for one `stream` call.
pub enum MockResponse {
    Steps(Vec<MockStep>),
    /// Fail before any step runs.
    Error(AgentError),
    /// Wait a duration (cancellable), then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Steps(vec![MockStep::text(text)])
    }

    pub fn steps(steps: Vec<MockStep>) -> Self {
        Self::Steps(steps)
    }

    pub fn error(error: AgentError) -> Self {
        Self::Error(error)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// Streams `prefix` text, then parks until cancelled.
    pub fn hang(prefix: &str) -> Self {
        Self::Steps(vec![MockStep::events(
            vec![MockEvent::Text(prefix.to_string()), MockEvent::Hang],
            ProviderFinishReason::Stop,
        )])
    }

    /// Streams `prefix`, waits on `gate`, then streams `rest` and ends the turn.
    pub fn gated(prefix: &str, gate: Arc<Notify>, rest: &str) -> Self {
        Self::Steps(vec![MockStep::events(
            vec![
                MockEvent::Text(prefix.to_string()),
                MockEvent::Wait(gate),
                MockEvent::Text(rest.to_string()),
            ],
            ProviderFinishReason::Stop,
        )])
    }
}

/// What the mock saw for one `stream` call.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub history: Vec<ModelMessage>,
    pub file_count: usize,
    pub tool_names: Vec<String>,
    pub options: CallOptions,
}

/// Mock model that replays responses in sequence.
pub struct MockModel {
    info: ModelInfo,
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
    prepared: Mutex<Vec<Vec<ModelMessage>>>,
}

impl MockModel {
    pub fn new(info: ModelInfo, responses: Vec<MockResponse>) -> Self {
        Self {
            info,
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
        }
    }

    /// A mock with a plain model description and the given context window.
    pub fn with_context_window(context_window: u64, responses: Vec<MockResponse>) -> Self {
        Self::new(Self::default_info(context_window), responses)
    }

    pub fn default_info(context_window: u64) -> ModelInfo {
        ModelInfo {
            id: "mock-model".to_string(),
            name: "Mock Model".to_string(),
            provider: "mock".to_string(),
            context_window,
            default_max_tokens: 4096,
            supports_images: true,
            can_reason: true,
            cost: loom_core::CostTable::default(),
            default_options: loom_core::ProviderOptions::new(),
        }
    }

    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Highest number of streams observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.prompt.clone()).collect()
    }

    /// Message lists returned by `prepare_step`, one per executed step.
    pub fn prepared_messages(&self) -> Vec<Vec<ModelMessage>> {
        self.prepared.lock().clone()
    }

    async fn resolve(
        &self,
        response: MockResponse,
        cancel: &CancellationToken,
    ) -> Result<Vec<MockStep>, AgentError> {
        let mut current = response;
        loop {
            match current {
                MockResponse::Steps(steps) => return Ok(steps),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(AgentError::Cancelled),
                        () = tokio::time::sleep(duration) => current = *inner,
                    }
                }
            }
        }
    }

    async fn run_steps(
        &self,
        steps: Vec<MockStep>,
        request: &StreamRequest,
        handler: &dyn StepHandler,
    ) -> Result<StreamResult, AgentError> {
        let cancel = &request.cancel;
        let mut messages = request.initial_messages();
        let mut results = Vec::new();
        let mut total_usage = Usage::default();
        let mut final_text = String::new();

        for (index, step) in steps.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let prepared = handler.prepare_step(index, messages.clone()).await?;
            self.prepared.lock().push(prepared.messages);
            let ctx = prepared.context;

            let mut step_text = String::new();
            let mut assistant_parts = Vec::new();
            let mut result_parts = Vec::new();

            for (n, event) in step.events.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                match event {
                    MockEvent::Reasoning { text, signature } => {
                        let id = format!("reasoning_{index}_{n}");
                        handler.on_reasoning_start(&id).await?;
                        handler.on_reasoning_delta(&id, &text).await?;
                        handler.on_reasoning_end(&id, signature.clone()).await?;
                        assistant_parts.push(ModelPart::Reasoning { text, signature });
                    }
                    MockEvent::Text(text) => {
                        handler.on_text_delta(&format!("text_{index}"), &text).await?;
                        step_text.push_str(&text);
                    }
                    MockEvent::ToolCall { id, name, input } => {
                        handler.on_tool_input_start(&id, &name).await?;
                        let call = ToolCallEvent {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.to_string(),
                            provider_executed: false,
                        };
                        handler.on_tool_call(&call).await?;
                        assistant_parts.push(ModelPart::ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            input: call.input.clone(),
                            provider_executed: false,
                        });

                        let response = match request.tools.iter().find(|t| t.name() == name) {
                            Some(tool) => match tool.execute(input, &ctx).await {
                                Ok(r) => r,
                                Err(e @ (AgentError::PermissionDenied | AgentError::Cancelled)) => {
                                    return Err(e)
                                }
                                Err(e) => ToolResponse::error(e.to_string()),
                            },
                            None => ToolResponse::error(format!("tool not found: {name}")),
                        };
                        let result = ToolResultEvent {
                            tool_call_id: id.clone(),
                            name: name.clone(),
                            response,
                        };
                        handler.on_tool_result(&result).await?;
                        result_parts.push(ModelPart::ToolResult {
                            tool_call_id: id,
                            name,
                            output: if result.response.is_error {
                                ToolOutput::Error {
                                    text: result.response.content,
                                }
                            } else {
                                ToolOutput::Text {
                                    text: result.response.content,
                                }
                            },
                        });
                    }
                    MockEvent::Wait(gate) => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Err(AgentError::Cancelled),
                            () = gate.notified() => {}
                        }
                    }
                    MockEvent::Hang => {
                        cancel.cancelled().await;
                        return Err(AgentError::Cancelled);
                    }
                }
            }

            let step_result = StepResult {
                finish_reason: step.finish,
                usage: step.usage,
                billed_cost: step.billed_cost,
                text: step_text.clone(),
            };
            handler.on_step_finish(&step_result).await?;
            total_usage.add(&step.usage);
            final_text = step_text.clone();
            let stop = handler.should_stop(&step_result);
            results.push(step_result);
            if stop || step.finish != ProviderFinishReason::ToolCalls {
                break;
            }

            if !step_text.is_empty() {
                assistant_parts.push(ModelPart::Text { text: step_text });
            }
            messages.push(ModelMessage::new(ModelRole::Assistant, assistant_parts));
            if !result_parts.is_empty() {
                messages.push(ModelMessage::new(ModelRole::Tool, result_parts));
            }
        }

        Ok(StreamResult {
            text: final_text,
            steps: results,
            total_usage,
        })
    }
}

struct ActiveStream<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveStream<'a> {
    fn enter(active: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveStream<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn stream(
        &self,
        request: StreamRequest,
        handler: &dyn StepHandler,
    ) -> Result<StreamResult, AgentError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(RecordedRequest {
            prompt: request.prompt.clone(),
            system_prompt: request.system_prompt.clone(),
            history: request.history.clone(),
            file_count: request.files.len(),
            tool_names: request.tools.iter().map(|t| t.name().to_string()).collect(),
            options: request.options.clone(),
        });

        let response = self.responses.lock().pop_front().ok_or_else(|| {
            AgentError::Other(format!("MockModel: no response configured for call {idx}"))
        })?;

        let _active = ActiveStream::enter(&self.active, &self.max_active);
        let steps = self.resolve(response, &request.cancel).await?;
        self.run_steps(steps, &request, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PreparedStep;
    use crate::tools::{Tool, ToolContext};
    use loom_core::{MessageId, SessionId};

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        stop_after_first: bool,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        async fn prepare_step(
            &self,
            step: usize,
            messages: Vec<ModelMessage>,
        ) -> Result<PreparedStep, AgentError> {
            self.log.lock().push(format!("prepare:{step}"));
            Ok(PreparedStep {
                messages,
                context: ToolContext {
                    session_id: SessionId::new(),
                    message_id: MessageId::new(),
                    model_id: "mock-model".into(),
                    supports_images: true,
                    cancel: CancellationToken::new(),
                },
            })
        }

        async fn on_text_delta(&self, _id: &str, text: &str) -> Result<(), AgentError> {
            self.log.lock().push(format!("text:{text}"));
            Ok(())
        }

        async fn on_tool_call(&self, call: &ToolCallEvent) -> Result<(), AgentError> {
            self.log.lock().push(format!("call:{}", call.name));
            Ok(())
        }

        async fn on_tool_result(&self, result: &ToolResultEvent) -> Result<(), AgentError> {
            self.log.lock().push(format!("result:{}", result.response.content));
            Ok(())
        }

        async fn on_step_finish(&self, step: &StepResult) -> Result<(), AgentError> {
            self.log.lock().push(format!("finish:{:?}", step.finish_reason));
            Ok(())
        }

        fn should_stop(&self, _step: &StepResult) -> bool {
            self.stop_after_first
        }
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResponse, AgentError> {
            Ok(ToolResponse::text(input["say"].as_str().unwrap_or_default()))
        }
    }

    fn request(tools: Vec<Arc<dyn Tool>>, cancel: CancellationToken) -> StreamRequest {
        StreamRequest {
            prompt: "go".into(),
            files: Vec::new(),
            system_prompt: "sys".into(),
            history: Vec::new(),
            tools,
            options: CallOptions::default(),
            cancel,
        }
    }

    #[tokio::test]
    async fn text_response_drives_callbacks() {
        let mock = MockModel::with_context_window(1000, vec![MockResponse::text("hello")]);
        let handler = Recorder::default();
        let result = mock
            .stream(request(Vec::new(), CancellationToken::new()), &handler)
            .await
            .unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(
            *handler.log.lock(),
            vec!["prepare:0", "text:hello", "finish:Stop"]
        );
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.prompts(), vec!["go"]);
    }

    #[tokio::test]
    async fn tool_steps_execute_tools_and_continue() {
        let mock = MockModel::with_context_window(
            1000,
            vec![MockResponse::steps(vec![
                MockStep::tool_call("c1", "echo", serde_json::json!({"say": "pong"})),
                MockStep::text("done"),
            ])],
        );
        let handler = Recorder::default();
        let result = mock
            .stream(request(vec![Arc::new(Echo)], CancellationToken::new()), &handler)
            .await
            .unwrap();
        assert_eq!(result.steps.len(), 2);
        assert_eq!(
            *handler.log.lock(),
            vec![
                "prepare:0",
                "call:echo",
                "result:pong",
                "finish:ToolCalls",
                "prepare:1",
                "text:done",
                "finish:Stop"
            ]
        );
        let second = &mock.prepared_messages()[1];
        assert_eq!(second.last().map(|m| m.role), Some(ModelRole::Tool));
    }

    #[tokio::test]
    async fn should_stop_ends_after_step() {
        let mock = MockModel::with_context_window(
            1000,
            vec![MockResponse::steps(vec![
                MockStep::tool_call("c1", "echo", serde_json::json!({})),
                MockStep::text("never"),
            ])],
        );
        let handler = Recorder {
            stop_after_first: true,
            ..Default::default()
        };
        let result = mock
            .stream(request(vec![Arc::new(Echo)], CancellationToken::new()), &handler)
            .await
            .unwrap();
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn hang_returns_cancelled() {
        let mock = MockModel::with_context_window(1000, vec![MockResponse::hang("partial")]);
        let handler = Recorder::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = mock
            .stream(request(Vec::new(), cancel), &handler)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn exhausted_responses_error() {
        let mock = MockModel::with_context_window(1000, vec![]);
        let err = mock
            .stream(request(Vec::new(), CancellationToken::new()), &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Other(_)));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let mock = MockModel::with_context_window(
            1000,
            vec![MockResponse::steps(vec![MockStep::tool_call(
                "c1",
                "missing",
                serde_json::json!({}),
            )])],
        );
        let handler = Recorder::default();
        mock.stream(request(Vec::new(), CancellationToken::new()), &handler)
            .await
            .unwrap();
        assert!(handler.log.lock().contains(&"result:tool not found: missing".to_string()));
    }
}
