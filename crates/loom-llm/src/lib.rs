//! Model runtime contract, provider-facing message shape, tool trait,
//! model catalog and credential refresh.

pub mod auth;
pub mod mock;
pub mod models;
pub mod prompt;
pub mod runtime;
pub mod tools;

pub use models::{find_model, resolve_model, ModelInfo};
pub use prompt::{FilePart, IntoModelMessages, ModelMessage, ModelPart, ModelRole, ToolOutput};
pub use runtime::{
    CallOptions, LanguageModel, PreparedStep, ProviderFinishReason, StepHandler, StepResult,
    StreamRequest, StreamResult, ToolCallEvent, ToolResultEvent,
};
pub use tools::{Tool, ToolContext, ToolDefinition, ToolResponse};
