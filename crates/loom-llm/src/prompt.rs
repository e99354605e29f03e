use bytes::Bytes;
use loom_core::message::{ContentPart, ToolResult};
use loom_core::{Message, ProviderOptions, Role};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilePart {
    pub filename: String,
    pub media_type: String,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutput {
    Text { text: String },
    Error { text: String },
    /// Base64 media plus any accompanying text.
    Media {
        data: String,
        media_type: String,
        text: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    File(FilePart),
    ToolCall {
        id: String,
        name: String,
        input: String,
        provider_executed: bool,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        output: ToolOutput,
    },
}

/// A message in the shape the model runtime sends to a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub parts: Vec<ModelPart>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub provider_options: ProviderOptions,
}

impl ModelMessage {
    pub fn new(role: ModelRole, parts: Vec<ModelPart>) -> Self {
        Self {
            role,
            parts,
            provider_options: ProviderOptions::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(ModelRole::System, vec![ModelPart::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(ModelRole::User, vec![ModelPart::Text { text: text.into() }])
    }

    pub fn user_with_files(text: impl Into<String>, files: Vec<FilePart>) -> Self {
        let mut parts = vec![ModelPart::Text { text: text.into() }];
        parts.extend(files.into_iter().map(ModelPart::File));
        Self::new(ModelRole::User, parts)
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelPart::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Conversion of a stored message into provider-facing messages.
pub trait IntoModelMessages {
    fn to_model_messages(&self) -> Vec<ModelMessage>;
}

impl IntoModelMessages for Message {
    fn to_model_messages(&self) -> Vec<ModelMessage> {
        match self.role {
            Role::User => {
                let mut text = self.text();
                let mut files = Vec::new();
                for binary in self.binary_parts() {
                    if is_text_media(&binary.mime_type) {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&inline_text_file(&binary.path, &binary.data));
                    } else {
                        files.push(ModelPart::File(FilePart {
                            filename: binary.path.clone(),
                            media_type: binary.mime_type.clone(),
                            data: binary.data.clone(),
                        }));
                    }
                }
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(ModelPart::Text { text });
                }
                parts.extend(files);
                if parts.is_empty() {
                    return Vec::new();
                }
                vec![ModelMessage::new(ModelRole::User, parts)]
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if let Some(reasoning) = self.reasoning() {
                    if !reasoning.text.is_empty() {
                        parts.push(ModelPart::Reasoning {
                            text: reasoning.text.clone(),
                            signature: reasoning.signature.clone(),
                        });
                    }
                }
                let text = self.text();
                if !text.is_empty() {
                    parts.push(ModelPart::Text { text });
                }
                for call in self.tool_calls() {
                    parts.push(ModelPart::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                        provider_executed: call.provider_executed,
                    });
                }
                if parts.is_empty() {
                    return Vec::new();
                }
                vec![ModelMessage::new(ModelRole::Assistant, parts)]
            }
            Role::Tool => {
                let parts: Vec<ModelPart> = self
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::ToolResult(r) => Some(tool_result_part(r)),
                        _ => None,
                    })
                    .collect();
                if parts.is_empty() {
                    return Vec::new();
                }
                vec![ModelMessage::new(ModelRole::Tool, parts)]
            }
        }
    }
}

/// Text attachments are sent inline instead of as file parts.
pub fn is_text_media(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
}

pub fn inline_text_file(path: &str, content: &[u8]) -> String {
    format!(
        "<file path=\"{path}\">\n{}\n</file>",
        String::from_utf8_lossy(content)
    )
}

pub fn tool_result_part(result: &ToolResult) -> ModelPart {
    let output = if result.is_error {
        ToolOutput::Error {
            text: result.content.clone(),
        }
    } else if let (true, Some(data), Some(mime)) =
        (result.is_media(), result.data.as_ref(), result.mime_type.as_ref())
    {
        ToolOutput::Media {
            data: data.clone(),
            media_type: mime.clone(),
            text: result.content.clone(),
        }
    } else {
        ToolOutput::Text {
            text: result.content.clone(),
        }
    };
    ModelPart::ToolResult {
        tool_call_id: result.tool_call_id.clone(),
        name: result.name.clone(),
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::message::{BinaryContent, ToolCall};
    use loom_core::SessionId;

    #[test]
    fn user_message_carries_binary_as_file() {
        let mut msg = Message::user_text(SessionId::new(), "look at this");
        msg.add_binary(BinaryContent {
            path: "shot.png".into(),
            mime_type: "image/png".into(),
            data: Bytes::from_static(&[1, 2, 3]),
        });
        let out = msg.to_model_messages();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, ModelRole::User);
        assert_eq!(out[0].text(), "look at this");
        assert!(matches!(&out[0].parts[1], ModelPart::File(f) if f.media_type == "image/png"));
    }

    #[test]
    fn text_binary_is_inlined() {
        let mut msg = Message::user_text(SessionId::new(), "review");
        msg.add_binary(BinaryContent {
            path: "notes.md".into(),
            mime_type: "text/markdown".into(),
            data: Bytes::from_static(b"- item"),
        });
        let out = msg.to_model_messages();
        assert_eq!(out[0].parts.len(), 1);
        assert_eq!(
            out[0].text(),
            "review\n<file path=\"notes.md\">\n- item\n</file>"
        );
    }

    #[test]
    fn assistant_message_orders_reasoning_text_calls() {
        let mut msg = Message::assistant(SessionId::new(), "m", "p");
        msg.upsert_tool_call(ToolCall {
            id: "c1".into(),
            name: "view".into(),
            input: "{}".into(),
            finished: true,
            provider_executed: false,
        });
        msg.append_text("done");
        msg.append_reasoning("plan");
        msg.finish_reasoning(Some("sig".into()));
        msg.set_finish(loom_core::FinishReason::ToolUse, None, None);

        let out = msg.to_model_messages();
        assert_eq!(out.len(), 1);
        let parts = &out[0].parts;
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], ModelPart::Reasoning { signature: Some(s), .. } if s == "sig"));
        assert!(matches!(&parts[1], ModelPart::Text { text } if text == "done"));
        assert_eq!(out[0].tool_call_ids(), vec!["c1"]);
    }

    #[test]
    fn empty_assistant_message_converts_to_nothing() {
        let mut msg = Message::assistant(SessionId::new(), "m", "p");
        msg.set_finish(loom_core::FinishReason::Canceled, None, None);
        assert!(msg.to_model_messages().is_empty());
    }

    #[test]
    fn tool_results_map_outputs() {
        let mut media = ToolResult {
            tool_call_id: "c2".into(),
            name: "view".into(),
            content: "image".into(),
            data: Some("AAEC".into()),
            mime_type: Some("image/png".into()),
            ..Default::default()
        };
        let err = ToolResult::error("c1", "bash", "boom");
        let msg = Message::tool_results(SessionId::new(), vec![err, media.clone()]);
        let out = msg.to_model_messages();
        assert_eq!(out[0].role, ModelRole::Tool);
        assert!(matches!(
            &out[0].parts[0],
            ModelPart::ToolResult { output: ToolOutput::Error { text }, .. } if text == "boom"
        ));
        assert!(matches!(
            &out[0].parts[1],
            ModelPart::ToolResult { output: ToolOutput::Media { .. }, .. }
        ));

        media.data = None;
        let msg = Message::tool_results(SessionId::new(), vec![media]);
        assert!(matches!(
            &msg.to_model_messages()[0].parts[0],
            ModelPart::ToolResult { output: ToolOutput::Text { .. }, .. }
        ));
    }
}
