//! Immutable per-run view of the agent's models, tools and prompts.

use std::sync::Arc;

use loom_llm::{CallOptions, LanguageModel, ModelInfo, Tool};
use loom_settings::ProviderKind;
use parking_lot::RwLock;

/// A built model plus what the agent needs to know about its provider.
#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn LanguageModel>,
    pub provider_id: String,
    pub provider_kind: ProviderKind,
    /// Merged catalog, provider and selection defaults for this model.
    pub options: CallOptions,
}

impl ModelHandle {
    pub fn new(model: Arc<dyn LanguageModel>, provider_kind: ProviderKind) -> Self {
        let provider_id = model.info().provider.clone();
        Self {
            model,
            provider_id,
            provider_kind,
            options: CallOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn info(&self) -> &ModelInfo {
        self.model.info()
    }
}

#[derive(Clone)]
pub struct AgentSnapshot {
    pub large: ModelHandle,
    pub small: ModelHandle,
    pub tools: Vec<Arc<dyn Tool>>,
    pub system_prompt: String,
    pub system_prompt_prefix: String,
}

impl AgentSnapshot {
    pub fn new(large: ModelHandle, small: ModelHandle) -> Self {
        Self {
            large,
            small,
            tools: Vec::new(),
            system_prompt: String::new(),
            system_prompt_prefix: String::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_system_prompt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.system_prompt_prefix = prefix.into();
        self
    }
}

/// Swappable snapshot. A run loads it once and keeps that copy to the end,
/// so setters only affect runs that start afterwards.
pub struct SnapshotCell {
    current: RwLock<Arc<AgentSnapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: AgentSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<AgentSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn update(&self, f: impl FnOnce(&mut AgentSnapshot)) {
        let mut guard = self.current.write();
        let mut next = AgentSnapshot::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_llm::mock::MockModel;

    fn handle(cw: u64) -> ModelHandle {
        ModelHandle::new(
            Arc::new(MockModel::with_context_window(cw, vec![])),
            ProviderKind::Anthropic,
        )
    }

    #[test]
    fn loaded_snapshot_is_unaffected_by_later_updates() {
        let cell = SnapshotCell::new(AgentSnapshot::new(handle(1000), handle(500)));
        let before = cell.load();
        cell.update(|s| {
            s.system_prompt = "new prompt".into();
            s.large = handle(9000);
        });
        assert_eq!(before.system_prompt, "");
        assert_eq!(before.large.info().context_window, 1000);
        let after = cell.load();
        assert_eq!(after.system_prompt, "new prompt");
        assert_eq!(after.large.info().context_window, 9000);
    }

    #[test]
    fn handle_takes_provider_id_from_model() {
        let h = handle(10);
        assert_eq!(h.provider_id, "mock");
    }
}
