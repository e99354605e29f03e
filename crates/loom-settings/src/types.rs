use std::collections::BTreeMap;

use loom_core::{CostTable, ProviderOptions, SamplingOptions};
use serde::{Deserialize, Serialize};

use crate::resolve::is_template;

/// Top-level settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: ModelSelections,
    pub options: AgentOptions,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id).filter(|p| !p.disabled)
    }

    pub fn provider_mut(&mut self, id: &str) -> Option<&mut ProviderConfig> {
        self.providers.get_mut(id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-compat")]
    OpenAiCompat,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "bedrock")]
    Bedrock,
    #[serde(rename = "vertex")]
    Vertex,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "copilot")]
    Copilot,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenAiCompat => "openai-compat",
            Self::Gemini => "gemini",
            Self::Bedrock => "bedrock",
            Self::Vertex => "vertex",
            Self::OpenRouter => "openrouter",
            Self::Copilot => "copilot",
        }
    }

    /// Providers whose tool-result channel can carry images and documents.
    pub fn supports_media_in_tool_results(&self) -> bool {
        matches!(self, Self::Anthropic | Self::Bedrock)
    }
}

/// Stored OAuth credentials. Wrapped in secrets once loaded by the auth layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
}

/// A model declared directly in a provider's configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomModel {
    pub id: String,
    pub name: String,
    pub context_window: u64,
    pub default_max_tokens: u64,
    pub supports_images: bool,
    pub can_reason: bool,
    pub cost: CostTable,
    pub default_options: ProviderOptions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Literal key or a `$VAR` template.
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthCredentials>,
    pub disabled: bool,
    pub extra_headers: BTreeMap<String, String>,
    /// Prepended as its own system message on every step.
    pub system_prompt_prefix: String,
    pub provider_options: ProviderOptions,
    pub models: Vec<CustomModel>,
}

impl ProviderConfig {
    pub fn uses_oauth(&self) -> bool {
        self.oauth.is_some()
    }

    pub fn has_templated_key(&self) -> bool {
        is_template(&self.api_key)
    }
}

/// Which provider and model a role (large or small) uses, plus per-model overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectedModel {
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub think: bool,
    pub provider_options: ProviderOptions,
}

impl SelectedModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSelections {
    pub large: SelectedModel,
    pub small: SelectedModel,
}

impl Default for ModelSelections {
    fn default() -> Self {
        Self {
            large: SelectedModel::new("anthropic", "claude-sonnet-4-5"),
            small: SelectedModel::new("anthropic", "claude-haiku-4-5"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentOptions {
    pub disable_auto_summarize: bool,
    /// Skip prompt-cache annotations on outgoing messages.
    pub disable_provider_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
