//! Active-request registry and per-session prompt queue.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use loom_core::{SessionAgentCall, SessionId};
use tokio_util::sync::CancellationToken;

/// Registry key for a session's summarization run.
pub fn summarize_key(session_id: &SessionId) -> String {
    format!("{}-summarize", session_id.as_str())
}

/// Maps a session id (or its summarize key) to the handle cancelling the
/// generation that currently owns it. Presence of a key means busy.
#[derive(Clone, Default)]
pub struct ActiveRequests {
    inner: Arc<DashMap<String, CancellationToken>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for a new generation. `None` if it is already claimed.
    pub fn try_register(&self, key: &str) -> Option<ActiveGuard> {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(ActiveGuard {
                    map: Arc::clone(&self.inner),
                    key: key.to_string(),
                    token,
                })
            }
        }
    }

    /// Signal cancellation. The entry stays until its owner releases it.
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Ownership of a registry entry; dropping it releases the key.
pub struct ActiveGuard {
    map: Arc<DashMap<String, CancellationToken>>,
    key: String,
    token: CancellationToken,
}

impl ActiveGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = self.map.remove(&self.key);
    }
}

/// Pending calls per session, drained in FIFO order.
#[derive(Clone, Default)]
pub struct PromptQueue {
    inner: Arc<DashMap<SessionId, VecDeque<SessionAgentCall>>>,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, call: SessionAgentCall) {
        self.inner
            .entry(call.session_id.clone())
            .or_default()
            .push_back(call);
    }

    pub fn pop_front(&self, session_id: &SessionId) -> Option<SessionAgentCall> {
        let call = {
            let mut queue = self.inner.get_mut(session_id)?;
            queue.pop_front()
        };
        let _ = self.inner.remove_if(session_id, |_, q| q.is_empty());
        call
    }

    /// Remove and return the calls queued behind the first `keep`, oldest
    /// first.
    pub fn take_after(&self, session_id: &SessionId, keep: usize) -> Vec<SessionAgentCall> {
        let taken: Vec<SessionAgentCall> = {
            let Some(mut queue) = self.inner.get_mut(session_id) else {
                return Vec::new();
            };
            if queue.len() <= keep {
                return Vec::new();
            }
            queue.split_off(keep).into_iter().collect()
        };
        let _ = self.inner.remove_if(session_id, |_, q| q.is_empty());
        taken
    }

    pub fn len(&self, session_id: &SessionId) -> usize {
        self.inner.get(session_id).map_or(0, |q| q.len())
    }

    pub fn prompts(&self, session_id: &SessionId) -> Vec<String> {
        self.inner
            .get(session_id)
            .map(|q| q.iter().map(|c| c.prompt.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &SessionId) {
        let _ = self.inner.remove(session_id);
    }

    pub fn clear_all(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_exclusive_until_guard_drops() {
        let active = ActiveRequests::new();
        let guard = active.try_register("sess_a").unwrap();
        assert!(active.try_register("sess_a").is_none());
        assert!(active.contains("sess_a"));
        assert!(active.try_register("sess_b").is_some());
        drop(guard);
        assert!(!active.contains("sess_a"));
        assert!(active.try_register("sess_a").is_some());
    }

    #[test]
    fn cancel_signals_but_keeps_entry() {
        let active = ActiveRequests::new();
        let guard = active.try_register("sess_a").unwrap();
        let token = guard.token();
        assert!(active.cancel("sess_a"));
        assert!(token.is_cancelled());
        assert!(active.contains("sess_a"));
        assert!(!active.cancel("sess_missing"));
        drop(guard);
        assert!(active.is_empty());
    }

    #[test]
    fn summarize_key_format() {
        let id = SessionId::from_raw("sess_1");
        assert_eq!(summarize_key(&id), "sess_1-summarize");
    }

    #[test]
    fn queue_is_fifo_per_session() {
        let queue = PromptQueue::new();
        let a = SessionId::new();
        let b = SessionId::new();
        queue.push_back(SessionAgentCall::new(a.clone(), "first"));
        queue.push_back(SessionAgentCall::new(b.clone(), "other"));
        queue.push_back(SessionAgentCall::new(a.clone(), "A"));
        queue.push_back(SessionAgentCall::new(a.clone(), "B"));

        assert_eq!(queue.prompts(&a), vec!["first", "A", "B"]);
        assert_eq!(queue.pop_front(&a).unwrap().prompt, "first");
        let tail = queue.take_after(&a, 1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].prompt, "B");
        assert!(queue.take_after(&a, 1).is_empty());
        assert_eq!(queue.take_after(&a, 0).len(), 1);
        assert_eq!(queue.len(&a), 0);
        assert!(queue.pop_front(&a).is_none());
        assert_eq!(queue.len(&b), 1);
    }

    #[test]
    fn empty_queue_entry_is_removed() {
        let queue = PromptQueue::new();
        let a = SessionId::new();
        queue.push_back(SessionAgentCall::new(a.clone(), "only"));
        assert!(queue.pop_front(&a).is_some());
        assert!(queue.inner.get(&a).is_none());
    }
}
