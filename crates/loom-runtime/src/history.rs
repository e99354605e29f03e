//! Converts stored messages into the provider-facing conversation and
//! applies the per-step rewrites the run loop needs.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use loom_core::message::{BinaryContent, ToolResult};
use loom_core::{Attachment, Message, MessageId, ProviderOptions, Role, SessionAgentCall, Todo};
use loom_llm::prompt::{inline_text_file, tool_result_part};
use loom_llm::{FilePart, IntoModelMessages, ModelMessage, ModelPart, ModelRole, ToolOutput};
use serde_json::json;
use tracing::warn;

use crate::prompts::TODO_REMINDER;

const MEDIA_PLACEHOLDER: &str = "[media attached in the following user message]";
const MEDIA_FOLLOWUP: &str = "Media returned by the previous tool call:";

/// Drop everything before the summary message and present the summary
/// as the user's opening turn.
pub fn truncate_at_summary(mut messages: Vec<Message>, summary: Option<&MessageId>) -> Vec<Message> {
    let Some(summary_id) = summary else {
        return messages;
    };
    let Some(idx) = messages.iter().position(|m| &m.id == summary_id) else {
        return messages;
    };
    drop(messages.drain(..idx));
    messages[0].role = Role::User;
    messages
}

/// Build the model conversation from stored messages.
///
/// Tool results are re-attached right after the assistant turn that issued
/// the call. Calls without a stored result are left out, and when two
/// assistant turns reuse a call id the first one keeps the result.
pub fn assemble_history(messages: &[Message]) -> Vec<ModelMessage> {
    let mut results: HashMap<&str, &ToolResult> = HashMap::new();
    for msg in messages.iter().filter(|m| m.role == Role::Tool) {
        for result in msg.tool_results_parts() {
            results.entry(result.tool_call_id.as_str()).or_insert(result);
        }
    }

    let mut emitted: HashSet<&str> = HashSet::new();
    let mut history = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::Tool => {}
            Role::User => history.extend(msg.to_model_messages()),
            Role::Assistant => {
                if !msg.has_content() {
                    continue;
                }
                let answered: Vec<&str> = msg
                    .tool_calls()
                    .into_iter()
                    .map(|c| c.id.as_str())
                    .filter(|id| results.contains_key(id) && !emitted.contains(id))
                    .collect();

                for mut converted in msg.to_model_messages() {
                    converted.parts.retain(|p| match p {
                        ModelPart::ToolCall { id, .. } => answered.contains(&id.as_str()),
                        _ => true,
                    });
                    if !converted.parts.is_empty() {
                        history.push(converted);
                    }
                }
                if answered.is_empty() {
                    continue;
                }
                let parts = answered
                    .iter()
                    .filter_map(|id| results.get(id))
                    .map(|r| tool_result_part(r))
                    .collect();
                history.push(ModelMessage::new(ModelRole::Tool, parts));
                emitted.extend(answered);
            }
        }
    }
    history
}

/// Top-level sessions with an empty todo list get a reminder up front.
pub fn with_todo_reminder(
    mut history: Vec<ModelMessage>,
    todos: &[Todo],
    is_sub_agent: bool,
) -> Vec<ModelMessage> {
    if !is_sub_agent && todos.is_empty() {
        history.insert(0, ModelMessage::user(TODO_REMINDER));
    }
    history
}

pub fn cache_control_options() -> ProviderOptions {
    let hint = json!({ "cache_control": { "type": "ephemeral" } });
    let mut options = ProviderOptions::new();
    let _ = options.insert("anthropic".to_string(), hint.clone());
    let _ = options.insert("bedrock".to_string(), hint);
    options
}

/// Mark the last system message and the final two messages as cacheable.
pub fn apply_cache_hints(messages: &mut [ModelMessage]) {
    if let Some(idx) = messages.iter().rposition(|m| m.role == ModelRole::System) {
        messages[idx].provider_options = cache_control_options();
    }
    let start = messages.len().saturating_sub(2);
    for message in &mut messages[start..] {
        message.provider_options = cache_control_options();
    }
}

/// For providers that cannot take media inside a tool result: replace the
/// media with a text placeholder and carry it in a user message that
/// follows the tool message.
pub fn rewrite_media_tool_results(messages: Vec<ModelMessage>) -> Vec<ModelMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for mut message in messages {
        if message.role != ModelRole::Tool {
            out.push(message);
            continue;
        }
        let mut files = Vec::new();
        for part in &mut message.parts {
            let ModelPart::ToolResult { name, output, .. } = part else {
                continue;
            };
            let replacement = match &*output {
                ToolOutput::Media {
                    data,
                    media_type,
                    text,
                } => match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => {
                        files.push(FilePart {
                            filename: format!("{name}-result"),
                            media_type: media_type.clone(),
                            data: Bytes::from(bytes),
                        });
                        let text = if text.is_empty() {
                            MEDIA_PLACEHOLDER.to_string()
                        } else {
                            format!("{text}\n{MEDIA_PLACEHOLDER}")
                        };
                        ToolOutput::Text { text }
                    }
                    Err(err) => {
                        warn!(tool = %name, error = %err, "tool media is not valid base64");
                        ToolOutput::Error {
                            text: "tool returned media that could not be decoded".to_string(),
                        }
                    }
                },
                _ => continue,
            };
            *output = replacement;
        }
        out.push(message);
        if !files.is_empty() {
            let mut parts = vec![ModelPart::Text {
                text: MEDIA_FOLLOWUP.to_string(),
            }];
            parts.extend(files.into_iter().map(ModelPart::File));
            out.push(ModelMessage::new(ModelRole::User, parts));
        }
    }
    out
}

/// Prompt text with text attachments inlined, plus the remaining files.
pub fn prepare_prompt(prompt: &str, attachments: &[Attachment]) -> (String, Vec<FilePart>) {
    let mut text = prompt.to_string();
    let mut files = Vec::new();
    for attachment in attachments {
        if attachment.is_text() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&inline_text_file(&attachment.file_path, &attachment.content));
        } else {
            files.push(FilePart {
                filename: attachment.file_path.clone(),
                media_type: attachment.mime_type.clone(),
                data: attachment.content.clone(),
            });
        }
    }
    (text, files)
}

/// The stored form of a submitted call.
pub fn user_message(call: &SessionAgentCall) -> Message {
    let mut message = Message::user_text(call.session_id.clone(), call.prompt.clone());
    for attachment in &call.attachments {
        message.add_binary(BinaryContent {
            path: attachment.file_path.clone(),
            mime_type: attachment.mime_type.clone(),
            data: attachment.content.clone(),
        });
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::message::ToolCall;
    use loom_core::{FinishReason, SessionId};

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "bash".into(),
            input: "{}".into(),
            finished: true,
            provider_executed: false,
        }
    }

    fn assistant_with_calls(session: &SessionId, ids: &[&str]) -> Message {
        let mut msg = Message::assistant(session.clone(), "m", "p");
        for id in ids {
            msg.upsert_tool_call(call(id));
        }
        msg.set_finish(FinishReason::ToolUse, None, None);
        msg
    }

    fn result(session: &SessionId, id: &str, text: &str) -> Message {
        Message::tool_results(
            session.clone(),
            vec![ToolResult {
                tool_call_id: id.into(),
                name: "bash".into(),
                content: text.into(),
                ..Default::default()
            }],
        )
    }

    #[test]
    fn orphan_tool_call_is_dropped_and_result_follows_call() {
        let s = SessionId::new();
        let messages = vec![
            Message::user_text(s.clone(), "run it"),
            assistant_with_calls(&s, &["c1", "c2"]),
            result(&s, "c1", "ok"),
        ];
        let history = assemble_history(&messages);
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, ModelRole::Assistant);
        assert_eq!(history[1].tool_call_ids(), vec!["c1"]);
        assert_eq!(history[2].role, ModelRole::Tool);
        assert_eq!(history[2].tool_result_ids(), vec!["c1"]);
    }

    #[test]
    fn result_stored_late_is_moved_next_to_its_call() {
        let s = SessionId::new();
        let messages = vec![
            assistant_with_calls(&s, &["c1"]),
            Message::user_text(s.clone(), "interjection"),
            result(&s, "c1", "ok"),
        ];
        let roles: Vec<ModelRole> = assemble_history(&messages).iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ModelRole::Assistant, ModelRole::Tool, ModelRole::User]);
    }

    #[test]
    fn duplicate_call_id_result_goes_to_first_turn() {
        let s = SessionId::new();
        let messages = vec![
            assistant_with_calls(&s, &["dup"]),
            result(&s, "dup", "first"),
            assistant_with_calls(&s, &["dup"]),
        ];
        let history = assemble_history(&messages);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].tool_result_ids(), vec!["dup"]);
    }

    #[test]
    fn empty_assistant_turns_are_dropped() {
        let s = SessionId::new();
        let mut empty = Message::assistant(s.clone(), "m", "p");
        empty.set_finish(FinishReason::Canceled, None, None);
        let mut only_orphans = assistant_with_calls(&s, &["c9"]);
        only_orphans.set_finish(FinishReason::Error, None, None);
        let messages = vec![Message::user_text(s.clone(), "hi"), empty, only_orphans];
        assert_eq!(assemble_history(&messages).len(), 1);
    }

    #[test]
    fn orphan_calls_keep_the_turn_text() {
        let s = SessionId::new();
        let mut msg = assistant_with_calls(&s, &["c1"]);
        msg.append_text("let me check");
        let history = assemble_history(&[msg]);
        assert_eq!(history.len(), 1);
        assert!(history[0].tool_call_ids().is_empty());
        assert_eq!(history[0].text(), "let me check");
    }

    #[test]
    fn summary_truncation_relabels_summary_as_user() {
        let s = SessionId::new();
        let old = Message::user_text(s.clone(), "old");
        let mut summary = Message::assistant(s.clone(), "m", "p");
        summary.is_summary_message = true;
        summary.append_text("the summary");
        let newer = Message::user_text(s.clone(), "next");
        let id = summary.id.clone();

        let kept = truncate_at_summary(vec![old, summary, newer], Some(&id));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].role, Role::User);
        assert_eq!(kept[0].text(), "the summary");

        let untouched = truncate_at_summary(
            vec![Message::user_text(s.clone(), "x")],
            Some(&MessageId::new()),
        );
        assert_eq!(untouched.len(), 1);
    }

    #[test]
    fn todo_reminder_only_for_top_level_sessions() {
        let history = vec![ModelMessage::user("hi")];
        let with = with_todo_reminder(history.clone(), &[], false);
        assert_eq!(with.len(), 2);
        assert!(with[0].text().contains("system_reminder"));
        assert_eq!(with_todo_reminder(history, &[], true).len(), 1);
    }

    #[test]
    fn cache_hints_mark_system_and_last_two() {
        let mut messages = vec![
            ModelMessage::system("sys"),
            ModelMessage::user("a"),
            ModelMessage::user("b"),
            ModelMessage::user("c"),
            ModelMessage::user("d"),
        ];
        messages[1]
            .provider_options
            .insert("stale".into(), json!(true));
        apply_cache_hints(&mut messages);
        let marked: Vec<bool> = messages
            .iter()
            .map(|m| m.provider_options.contains_key("anthropic"))
            .collect();
        assert_eq!(marked, vec![true, false, false, true, true]);
    }

    #[test]
    fn media_results_move_into_user_message() {
        let messages = vec![
            ModelMessage::user("show me"),
            ModelMessage::new(
                ModelRole::Tool,
                vec![ModelPart::ToolResult {
                    tool_call_id: "c1".into(),
                    name: "view".into(),
                    output: ToolOutput::Media {
                        data: BASE64.encode([1u8, 2, 3]),
                        media_type: "image/png".into(),
                        text: String::new(),
                    },
                }],
            ),
        ];
        let out = rewrite_media_tool_results(messages);
        assert_eq!(out.len(), 3);
        assert!(matches!(
            &out[1].parts[0],
            ModelPart::ToolResult { output: ToolOutput::Text { text }, .. } if text == MEDIA_PLACEHOLDER
        ));
        assert_eq!(out[2].role, ModelRole::User);
        match &out[2].parts[1] {
            ModelPart::File(file) => {
                assert_eq!(file.media_type, "image/png");
                assert_eq!(file.data.as_ref(), &[1, 2, 3]);
            }
            other => panic!("expected file part, got {other:?}"),
        }
    }

    #[test]
    fn text_attachments_inline_and_binaries_become_files() {
        let attachments = vec![
            Attachment::new("src/lib.rs", "text/x-rust", "fn main() {}"),
            Attachment::new("shot.png", "image/png", vec![0u8, 1]),
        ];
        let (text, files) = prepare_prompt("review", &attachments);
        assert_eq!(text, "review\n<file path=\"src/lib.rs\">\nfn main() {}\n</file>");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].media_type, "image/png");
    }

    #[test]
    fn stored_user_message_round_trips_to_same_prompt() {
        let call = SessionAgentCall::new(SessionId::new(), "review").with_attachments(vec![
            Attachment::new("notes.txt", "text/plain", "todo"),
        ]);
        let stored = user_message(&call);
        let (text, _) = prepare_prompt(&call.prompt, &call.attachments);
        assert_eq!(stored.to_model_messages()[0].text(), text);
    }
}
