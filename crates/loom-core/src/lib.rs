//! Shared types for the loom agent runtime: ids, the conversation data
//! model, token usage and the error taxonomy used by every other crate.

pub mod call;
pub mod errors;
pub mod ids;
pub mod message;
pub mod session;
pub mod usage;

pub use call::{Attachment, ProviderOptions, SamplingOptions, SessionAgentCall};
pub use errors::{AgentError, ProviderError, StoreError};
pub use ids::{MessageId, PermissionRequestId, SessionId};
pub use message::{ContentPart, FinishReason, Message, Role};
pub use session::{Session, Todo, TodoStatus};
pub use usage::{CostTable, Usage};
