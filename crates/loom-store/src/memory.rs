use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use loom_core::{Message, MessageId, Session, SessionId, StoreError};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::pubsub::{Broker, StoreEvent};
use crate::traits::{MessageStore, SessionStore};

/// Process-local message store, kept in insertion order.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<Message>>,
    broker: Broker<Message>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, message: Message) -> Result<Message, StoreError> {
        {
            let mut messages = self.messages.write();
            if messages.iter().any(|m| m.id == message.id) {
                return Err(StoreError::Conflict(message.id.to_string()));
            }
            messages.push(message.clone());
        }
        self.broker.publish(StoreEvent::Created(message.clone()));
        Ok(message)
    }

    async fn update(&self, message: &Message) -> Result<(), StoreError> {
        let mut updated = message.clone();
        updated.updated_at = Utc::now();
        {
            let mut messages = self.messages.write();
            let slot = messages
                .iter_mut()
                .find(|m| m.id == message.id)
                .ok_or_else(|| StoreError::NotFound(message.id.to_string()))?;
            *slot = updated.clone();
        }
        self.broker.publish(StoreEvent::Updated(updated));
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.messages
            .read()
            .iter()
            .find(|m| &m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| &m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &MessageId) -> Result<(), StoreError> {
        let removed = {
            let mut messages = self.messages.write();
            let idx = messages
                .iter()
                .position(|m| &m.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            messages.remove(idx)
        };
        self.broker.publish(StoreEvent::Deleted(removed));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<Message>> {
        self.broker.subscribe()
    }
}

/// Process-local session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Session>,
    broker: Broker<Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<Session, StoreError> {
        if self.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(session.id.to_string()));
        }
        let _ = self.sessions.insert(session.id.clone(), session.clone());
        self.broker.publish(StoreEvent::Created(session.clone()));
        Ok(session)
    }

    async fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, session: &Session) -> Result<Session, StoreError> {
        let mut saved = session.clone();
        saved.updated_at = Utc::now();
        {
            let mut slot = self
                .sessions
                .get_mut(&session.id)
                .ok_or_else(|| StoreError::NotFound(session.id.to_string()))?;
            *slot = saved.clone();
        }
        self.broker.publish(StoreEvent::Updated(saved.clone()));
        Ok(saved)
    }

    async fn update_title_and_usage(
        &self,
        id: &SessionId,
        title: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) -> Result<(), StoreError> {
        let updated = {
            let mut slot = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            slot.title = title.to_string();
            slot.prompt_tokens += prompt_tokens;
            slot.completion_tokens += completion_tokens;
            slot.cost += cost;
            slot.updated_at = Utc::now();
            slot.clone()
        };
        self.broker.publish(StoreEvent::Updated(updated));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent<Session>> {
        self.broker.subscribe()
    }
}
