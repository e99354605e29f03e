use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Provider-keyed option bag passed through to the model runtime.
pub type ProviderOptions = serde_json::Map<String, serde_json::Value>;

/// A file supplied alongside a prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub content: Bytes,
}

impl Attachment {
    pub fn new(
        file_path: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        let file_path = file_path.into();
        let file_name = file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(file_path.as_str())
            .to_string();
        Self {
            file_path,
            file_name,
            mime_type: mime_type.into(),
            content: content.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.mime_type.starts_with("text/")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

/// One unit of work submitted to the session run loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionAgentCall {
    pub session_id: SessionId,
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sampling: SamplingOptions,
    #[serde(default)]
    pub provider_options: ProviderOptions,
}

impl SessionAgentCall {
    pub fn new(session_id: SessionId, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            prompt: prompt.into(),
            attachments: Vec::new(),
            sampling: SamplingOptions::default(),
            provider_options: ProviderOptions::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn has_text_attachment(&self) -> bool {
        self.attachments.iter().any(Attachment::is_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_derives_file_name() {
        let a = Attachment::new("/tmp/notes/todo.md", "text/markdown", "x".as_bytes().to_vec());
        assert_eq!(a.file_name, "todo.md");
        assert!(a.is_text());
        assert!(!a.is_image());
    }

    #[test]
    fn detects_text_attachments() {
        let call = SessionAgentCall::new(SessionId::new(), "")
            .with_attachments(vec![Attachment::new("a.png", "image/png", vec![0u8, 1])]);
        assert!(!call.has_text_attachment());

        let call = call.with_attachments(vec![Attachment::new("a.txt", "text/plain", "hi".as_bytes().to_vec())]);
        assert!(call.has_text_attachment());
    }
}
