//! Finalizing the in-flight assistant message after a failed run.

use std::collections::HashSet;

use loom_core::message::ToolResult;
use loom_core::{AgentError, FinishReason, Message, StoreError};
use loom_settings::ProviderKind;
use loom_store::MessageStore;
use tracing::debug;

use crate::snapshot::ModelHandle;

const COPILOT_UNSUPPORTED_MODEL: &str = "The requested model is not supported";
const COPILOT_FEATURES_URL: &str = "https://github.com/settings/copilot/features";

/// Close open tool calls, add a synthetic error result for every call that
/// has none, and record why the message ended. Safe to run more than once.
pub(crate) async fn finalize_failed_run(
    messages: &dyn MessageStore,
    current: Option<Message>,
    error: &AgentError,
    model: &ModelHandle,
) -> Result<(), StoreError> {
    let Some(mut message) = current else {
        return Ok(());
    };
    let closed = message.finish_open_tool_calls();
    if closed > 0 {
        debug!(closed, "closed unfinished tool calls");
    }

    let answered: HashSet<String> = messages
        .list(&message.session_id)
        .await?
        .iter()
        .flat_map(|m| m.tool_results_parts())
        .map(|r| r.tool_call_id.clone())
        .collect();
    let text = synthetic_result_text(error);
    let missing: Vec<ToolResult> = message
        .tool_calls()
        .into_iter()
        .filter(|call| !answered.contains(&call.id))
        .map(|call| ToolResult::error(call.id.clone(), call.name.clone(), text))
        .collect();
    for result in missing {
        let _ = messages
            .create(Message::tool_results(message.session_id.clone(), vec![result]))
            .await?;
    }

    let (reason, title, details) = finish_for_error(error, model);
    message.set_finish(reason, title, details);
    messages.update(&message).await
}

fn synthetic_result_text(error: &AgentError) -> &'static str {
    match error {
        AgentError::Cancelled => "canceled by user",
        AgentError::PermissionDenied => "user denied permission",
        _ => "tool execution did not complete because the request failed",
    }
}

fn finish_for_error(
    error: &AgentError,
    model: &ModelHandle,
) -> (FinishReason, Option<String>, Option<String>) {
    match error {
        AgentError::Cancelled => (
            FinishReason::Canceled,
            Some("Request cancelled".to_string()),
            None,
        ),
        AgentError::PermissionDenied => (
            FinishReason::PermissionDenied,
            Some("User denied permission".to_string()),
            None,
        ),
        AgentError::Provider(err)
            if model.provider_kind == ProviderKind::Copilot
                && err.message.contains(COPILOT_UNSUPPORTED_MODEL) =>
        {
            (
                FinishReason::Error,
                Some("Copilot model not enabled".to_string()),
                Some(format!(
                    "\"{}\" is not enabled for your Copilot account. Enable it at {COPILOT_FEATURES_URL}",
                    model.info().name
                )),
            )
        }
        AgentError::Provider(err) => (
            FinishReason::Error,
            Some(capitalize(&err.title)),
            Some(err.message.clone()),
        ),
        other => (
            FinishReason::Error,
            Some("Error".to_string()),
            Some(other.to_string()),
        ),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use loom_core::message::ToolCall;
    use loom_core::{ProviderError, Role, SessionId};
    use loom_llm::mock::MockModel;
    use loom_store::InMemoryMessageStore;

    fn handle(kind: ProviderKind) -> ModelHandle {
        ModelHandle::new(Arc::new(MockModel::with_context_window(1000, vec![])), kind)
    }

    async fn interrupted(store: &InMemoryMessageStore, session: &SessionId) -> Message {
        let mut msg = Message::assistant(session.clone(), "m", "p");
        msg.upsert_tool_call(ToolCall {
            id: "done".into(),
            name: "view".into(),
            input: "{\"path\":\"a\"}".into(),
            finished: true,
            provider_executed: false,
        });
        msg.upsert_tool_call(ToolCall {
            id: "open".into(),
            name: "bash".into(),
            input: "{\"comm".into(),
            finished: false,
            provider_executed: false,
        });
        let msg = store.create(msg).await.unwrap();
        store
            .create(Message::tool_results(
                session.clone(),
                vec![ToolResult {
                    tool_call_id: "done".into(),
                    name: "view".into(),
                    content: "file contents".into(),
                    ..Default::default()
                }],
            ))
            .await
            .unwrap();
        msg
    }

    #[tokio::test]
    async fn cancellation_closes_calls_and_fills_missing_results_once() {
        let store = InMemoryMessageStore::new();
        let session = SessionId::new();
        let msg = interrupted(&store, &session).await;
        let model = handle(ProviderKind::Anthropic);

        finalize_failed_run(&store, Some(msg.clone()), &AgentError::Cancelled, &model)
            .await
            .unwrap();
        let stored = store.get(&msg.id).await.unwrap();
        finalize_failed_run(&store, Some(stored.clone()), &AgentError::Cancelled, &model)
            .await
            .unwrap();

        let all = store.list(&session).await.unwrap();
        let results: Vec<&ToolResult> = all
            .iter()
            .filter(|m| m.role == Role::Tool)
            .flat_map(|m| m.tool_results_parts())
            .collect();
        assert_eq!(results.len(), 2);
        let synthetic = results.iter().find(|r| r.tool_call_id == "open").unwrap();
        assert!(synthetic.is_error);
        assert_eq!(synthetic.content, "canceled by user");

        let finished = store.get(&msg.id).await.unwrap();
        assert!(finished.tool_calls().iter().all(|c| c.finished));
        let open = finished.tool_calls().into_iter().find(|c| c.id == "open").unwrap();
        assert_eq!(open.input, "{}");
        let finish = finished.finish_part().unwrap();
        assert_eq!(finish.reason, FinishReason::Canceled);
        assert_eq!(finish.title.as_deref(), Some("Request cancelled"));
    }

    #[tokio::test]
    async fn permission_denial_marks_message() {
        let store = InMemoryMessageStore::new();
        let session = SessionId::new();
        let msg = interrupted(&store, &session).await;
        finalize_failed_run(
            &store,
            Some(msg.clone()),
            &AgentError::PermissionDenied,
            &handle(ProviderKind::Anthropic),
        )
        .await
        .unwrap();
        let all = store.list(&session).await.unwrap();
        assert!(all
            .iter()
            .flat_map(|m| m.tool_results_parts())
            .any(|r| r.content == "user denied permission"));
        assert_eq!(
            store.get(&msg.id).await.unwrap().finish_reason(),
            Some(FinishReason::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn no_current_message_is_a_no_op() {
        let store = InMemoryMessageStore::new();
        finalize_failed_run(&store, None, &AgentError::Cancelled, &handle(ProviderKind::Anthropic))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn provider_titles_are_capitalized() {
        let err = AgentError::Provider(ProviderError::new("rate limit exceeded", "slow down"));
        let (reason, title, details) = finish_for_error(&err, &handle(ProviderKind::OpenAi));
        assert_eq!(reason, FinishReason::Error);
        assert_eq!(title.as_deref(), Some("Rate limit exceeded"));
        assert_eq!(details.as_deref(), Some("slow down"));
    }

    #[test]
    fn copilot_unsupported_model_links_settings() {
        let err = AgentError::Provider(ProviderError::new(
            "bad request",
            "The requested model is not supported.",
        ));
        let (_, title, details) = finish_for_error(&err, &handle(ProviderKind::Copilot));
        assert_eq!(title.as_deref(), Some("Copilot model not enabled"));
        assert!(details.unwrap().contains(COPILOT_FEATURES_URL));

        let (_, title, _) = finish_for_error(&err, &handle(ProviderKind::OpenAi));
        assert_eq!(title.as_deref(), Some("Bad request"));
    }

    #[test]
    fn generic_errors_carry_display_text() {
        let (reason, _, details) =
            finish_for_error(&AgentError::Other("socket closed".into()), &handle(ProviderKind::Gemini));
        assert_eq!(reason, FinishReason::Error);
        assert_eq!(details.as_deref(), Some("socket closed"));
    }
}
