use serde::{Deserialize, Serialize};

/// Token counts reported for one step or accumulated across a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub reasoning_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }

    /// Prompt-side tokens as tracked on the session.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_tokens
    }

    /// Completion-side tokens as tracked on the session.
    pub fn completion_tokens(&self) -> u64 {
        self.output_tokens + self.cache_read_tokens
    }
}

/// Per-million-token prices for a model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostTable {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl CostTable {
    pub fn calculate(&self, usage: &Usage) -> f64 {
        let per = |tokens: u64, price: f64| tokens as f64 / 1_000_000.0 * price;
        per(usage.input_tokens, self.input_per_mtok)
            + per(usage.output_tokens, self.output_per_mtok)
            + per(usage.cache_read_tokens, self.cache_read_per_mtok)
            + per(usage.cache_creation_tokens, self.cache_write_per_mtok)
    }

    /// Cost of a step, preferring a provider-billed amount when present.
    pub fn cost_with_override(&self, usage: &Usage, billed: Option<f64>) -> f64 {
        billed.unwrap_or_else(|| self.calculate(usage))
    }
}
