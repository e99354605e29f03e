//! # loom-runtime
//!
//! The agent orchestration core:
//!
//! - [`SessionAgent`]: one in-flight run per session, a FIFO of prompts
//!   submitted while busy, and cancellation of runs and summaries.
//! - [`history`]: converts stored messages into model input, dropping
//!   orphaned tool calls and annotating prompt-cache hints.
//! - Auto-summarization once the context window is nearly full, with a
//!   continuation prompt queued when a tool loop was cut short.
//! - [`Coordinator`]: builds models from settings and retries a rejected
//!   request once after refreshing credentials.

#![deny(unsafe_code)]

pub mod agent;
pub mod coordinator;
mod handler;
pub mod history;
pub mod permission;
pub mod prompts;
mod recovery;
pub mod registry;
pub mod snapshot;
pub mod summarize;
pub mod title;

pub use agent::{AgentResult, SessionAgent, SessionAgentConfig};
pub use coordinator::{
    merge_call_options, Coordinator, CoordinatorDeps, Credential, ModelFactory, PromptBuilder,
    StaticPrompts, StaticTools, ToolFactory,
};
pub use permission::{CreatePermissionRequest, PermissionGate, PermissionRequest, PermissionService};
pub use snapshot::{AgentSnapshot, ModelHandle};
pub use summarize::{should_summarize, summarization_buffer};
pub use title::clean_title;
