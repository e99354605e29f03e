use loom_core::{CostTable, ProviderOptions};
use loom_settings::{CustomModel, ProviderConfig};
use serde::{Deserialize, Serialize};

/// Capabilities and pricing of a provider model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window: u64,
    pub default_max_tokens: u64,
    pub supports_images: bool,
    pub can_reason: bool,
    pub cost: CostTable,
    /// Upstream default provider options, lowest merge precedence.
    #[serde(default)]
    pub default_options: ProviderOptions,
}

impl ModelInfo {
    pub fn from_custom(provider: &str, model: &CustomModel) -> Self {
        Self {
            id: model.id.clone(),
            name: if model.name.is_empty() {
                model.id.clone()
            } else {
                model.name.clone()
            },
            provider: provider.to_string(),
            context_window: model.context_window,
            default_max_tokens: model.default_max_tokens,
            supports_images: model.supports_images,
            can_reason: model.can_reason,
            cost: model.cost,
            default_options: model.default_options.clone(),
        }
    }
}

struct CatalogEntry {
    id: &'static str,
    name: &'static str,
    provider: &'static str,
    context_window: u64,
    default_max_tokens: u64,
    supports_images: bool,
    can_reason: bool,
    cost: CostTable,
}

impl From<&CatalogEntry> for ModelInfo {
    fn from(e: &CatalogEntry) -> Self {
        Self {
            id: e.id.to_string(),
            name: e.name.to_string(),
            provider: e.provider.to_string(),
            context_window: e.context_window,
            default_max_tokens: e.default_max_tokens,
            supports_images: e.supports_images,
            can_reason: e.can_reason,
            cost: e.cost,
            default_options: ProviderOptions::new(),
        }
    }
}

static CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "claude-sonnet-4-5",
        name: "Claude Sonnet 4.5",
        provider: "anthropic",
        context_window: 200_000,
        default_max_tokens: 50_000,
        supports_images: true,
        can_reason: true,
        cost: CostTable {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_per_mtok: 0.3,
            cache_write_per_mtok: 3.75,
        },
    },
    CatalogEntry {
        id: "claude-opus-4-1",
        name: "Claude Opus 4.1",
        provider: "anthropic",
        context_window: 200_000,
        default_max_tokens: 32_000,
        supports_images: true,
        can_reason: true,
        cost: CostTable {
            input_per_mtok: 15.0,
            output_per_mtok: 75.0,
            cache_read_per_mtok: 1.5,
            cache_write_per_mtok: 18.75,
        },
    },
    CatalogEntry {
        id: "claude-haiku-4-5",
        name: "Claude Haiku 4.5",
        provider: "anthropic",
        context_window: 200_000,
        default_max_tokens: 32_000,
        supports_images: true,
        can_reason: true,
        cost: CostTable {
            input_per_mtok: 1.0,
            output_per_mtok: 5.0,
            cache_read_per_mtok: 0.1,
            cache_write_per_mtok: 1.25,
        },
    },
    CatalogEntry {
        id: "gpt-5",
        name: "GPT-5",
        provider: "openai",
        context_window: 400_000,
        default_max_tokens: 128_000,
        supports_images: true,
        can_reason: true,
        cost: CostTable {
            input_per_mtok: 1.25,
            output_per_mtok: 10.0,
            cache_read_per_mtok: 0.125,
            cache_write_per_mtok: 0.0,
        },
    },
    CatalogEntry {
        id: "gpt-5-mini",
        name: "GPT-5 Mini",
        provider: "openai",
        context_window: 400_000,
        default_max_tokens: 128_000,
        supports_images: true,
        can_reason: true,
        cost: CostTable {
            input_per_mtok: 0.25,
            output_per_mtok: 2.0,
            cache_read_per_mtok: 0.025,
            cache_write_per_mtok: 0.0,
        },
    },
    CatalogEntry {
        id: "gemini-2.5-pro",
        name: "Gemini 2.5 Pro",
        provider: "gemini",
        context_window: 1_048_576,
        default_max_tokens: 50_000,
        supports_images: true,
        can_reason: true,
        cost: CostTable {
            input_per_mtok: 1.25,
            output_per_mtok: 10.0,
            cache_read_per_mtok: 0.31,
            cache_write_per_mtok: 0.0,
        },
    },
    CatalogEntry {
        id: "qwen3-coder",
        name: "Qwen3 Coder",
        provider: "openrouter",
        context_window: 262_144,
        default_max_tokens: 32_768,
        supports_images: false,
        can_reason: false,
        cost: CostTable {
            input_per_mtok: 0.2,
            output_per_mtok: 0.8,
            cache_read_per_mtok: 0.0,
            cache_write_per_mtok: 0.0,
        },
    },
];

/// Look up a built-in model by provider and id.
pub fn find_model(provider: &str, id: &str) -> Option<ModelInfo> {
    CATALOG
        .iter()
        .find(|m| m.provider == provider && m.id == id)
        .map(ModelInfo::from)
}

/// Models declared in the provider config win over the built-in catalog.
pub fn resolve_model(provider: &ProviderConfig, id: &str) -> Option<ModelInfo> {
    provider
        .models
        .iter()
        .find(|m| m.id == id)
        .map(|m| ModelInfo::from_custom(&provider.id, m))
        .or_else(|| find_model(provider.kind.as_str(), id))
        .map(|mut info| {
            info.provider = provider.id.clone();
            info
        })
}
