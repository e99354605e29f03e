use async_trait::async_trait;
use loom_core::{Message, MessageId, Session, SessionId, StoreError};
use tokio::sync::broadcast;

use crate::pubsub::StoreEvent;

/// Durable conversation messages. Every mutation publishes a [`StoreEvent`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, StoreError>;
    async fn update(&self, message: &Message) -> Result<(), StoreError>;
    async fn get(&self, id: &MessageId) -> Result<Message, StoreError>;
    /// Messages of a session in creation order.
    async fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError>;
    async fn delete(&self, id: &MessageId) -> Result<(), StoreError>;
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<Message>>;
}

/// Durable session metadata. Every mutation publishes a [`StoreEvent`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session, StoreError>;
    async fn get(&self, id: &SessionId) -> Result<Session, StoreError>;
    async fn save(&self, session: &Session) -> Result<Session, StoreError>;

    /// Atomically set the title and add the given token and cost deltas,
    /// leaving every other field untouched.
    async fn update_title_and_usage(
        &self,
        id: &SessionId,
        title: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<Session>>;
}
