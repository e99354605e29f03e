//! Message and session store contracts, with in-memory implementations.

pub mod memory;
pub mod pubsub;
pub mod traits;

pub use memory::{InMemoryMessageStore, InMemorySessionStore};
pub use pubsub::{Broker, StoreEvent};
pub use traits::{MessageStore, SessionStore};
