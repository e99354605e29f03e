use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Why a generation step (or a whole run) ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Canceled,
    Error,
    PermissionDenied,
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Serialized JSON input. Empty while the input is still streaming.
    pub input: String,
    pub finished: bool,
    #[serde(default)]
    pub provider_executed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    /// Base64 payload for media results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn error(tool_call_id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: text.into(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn is_media(&self) -> bool {
        self.data.is_some()
            && self
                .mime_type
                .as_deref()
                .is_some_and(|m| m.starts_with("image/") || m == "application/pdf")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinaryContent {
    pub path: String,
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finish {
    pub reason: FinishReason,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning(ReasoningContent),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Binary(BinaryContent),
    Finish(Finish),
}

/// A stored conversation message.
///
/// Assistant messages are created once per generation step and then
/// mutated in place while content streams in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub is_summary_message: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: SessionId, role: Role, parts: Vec<ContentPart>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            session_id,
            role,
            parts,
            model: None,
            provider: None,
            is_summary_message: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user_text(session_id: SessionId, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn assistant(session_id: SessionId, model: impl Into<String>, provider: impl Into<String>) -> Self {
        let mut msg = Self::new(session_id, Role::Assistant, Vec::new());
        msg.model = Some(model.into());
        msg.provider = Some(provider.into());
        msg
    }

    pub fn tool_results(session_id: SessionId, results: Vec<ToolResult>) -> Self {
        Self::new(
            session_id,
            Role::Tool,
            results.into_iter().map(ContentPart::ToolResult).collect(),
        )
    }

    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reasoning(&self) -> Option<&ReasoningContent> {
        self.parts.iter().find_map(|p| match p {
            ContentPart::Reasoning(r) => Some(r),
            _ => None,
        })
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results_parts(&self) -> Vec<&ToolResult> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn binary_parts(&self) -> Vec<&BinaryContent> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Binary(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn finish_part(&self) -> Option<&Finish> {
        self.parts.iter().find_map(|p| match p {
            ContentPart::Finish(f) => Some(f),
            _ => None,
        })
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_part().map(|f| f.reason)
    }

    pub fn is_finished(&self) -> bool {
        self.finish_part().is_some()
    }

    /// True when the message carries text, reasoning or tool calls.
    pub fn has_content(&self) -> bool {
        !self.text().trim().is_empty()
            || self.reasoning().is_some_and(|r| !r.text.trim().is_empty())
            || !self.tool_calls().is_empty()
    }

    pub fn append_text(&mut self, delta: &str) {
        for part in &mut self.parts {
            if let ContentPart::Text { text } = part {
                text.push_str(delta);
                return;
            }
        }
        self.parts.push(ContentPart::Text {
            text: delta.to_string(),
        });
    }

    fn reasoning_mut(&mut self) -> Option<&mut ReasoningContent> {
        if !self.parts.iter().any(|p| matches!(p, ContentPart::Reasoning(_))) {
            self.parts.push(ContentPart::Reasoning(ReasoningContent::default()));
        }
        self.parts.iter_mut().find_map(|p| match p {
            ContentPart::Reasoning(r) => Some(r),
            _ => None,
        })
    }

    pub fn start_reasoning(&mut self) {
        if let Some(r) = self.reasoning_mut() {
            r.started_at.get_or_insert_with(Utc::now);
        }
    }

    pub fn append_reasoning(&mut self, delta: &str) {
        if let Some(r) = self.reasoning_mut() {
            r.started_at.get_or_insert_with(Utc::now);
            r.text.push_str(delta);
        }
    }

    pub fn finish_reasoning(&mut self, signature: Option<String>) {
        if let Some(r) = self.reasoning_mut() {
            if signature.is_some() {
                r.signature = signature;
            }
            r.finished_at = Some(Utc::now());
        }
    }

    /// Insert a tool call, or replace the one with the same id.
    pub fn upsert_tool_call(&mut self, call: ToolCall) {
        for part in &mut self.parts {
            if let ContentPart::ToolCall(existing) = part {
                if existing.id == call.id {
                    *existing = call;
                    return;
                }
            }
        }
        self.parts.push(ContentPart::ToolCall(call));
    }

    /// Force every unfinished tool call to finished with an empty input
    /// object. Returns how many calls were changed.
    pub fn finish_open_tool_calls(&mut self) -> usize {
        let mut changed = 0;
        for part in &mut self.parts {
            if let ContentPart::ToolCall(call) = part {
                if !call.finished {
                    call.finished = true;
                    call.input = "{}".to_string();
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn add_binary(&mut self, content: BinaryContent) {
        self.parts.push(ContentPart::Binary(content));
    }

    /// Set the finish marker, replacing any previous one.
    pub fn set_finish(&mut self, reason: FinishReason, title: Option<String>, details: Option<String>) {
        self.parts.retain(|p| !matches!(p, ContentPart::Finish(_)));
        self.parts.push(ContentPart::Finish(Finish {
            reason,
            time: Utc::now(),
            title,
            details,
        }));
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
