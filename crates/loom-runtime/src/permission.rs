//! Tool permission prompts.
//!
//! Tools ask the gate before side effects. A request blocks until it is
//! granted or denied through [`PermissionService`], or until the run is
//! cancelled. Sub-agent sessions are auto-approved.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use loom_core::{AgentError, PermissionRequestId, SessionId};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreatePermissionRequest {
    pub session_id: SessionId,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    pub params: serde_json::Value,
}

/// A request waiting for a decision.
#[derive(Clone, Debug, PartialEq)]
pub struct PermissionRequest {
    pub id: PermissionRequestId,
    pub session_id: SessionId,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    pub params: serde_json::Value,
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// `Ok(true)` if granted, `Ok(false)` if denied, `Err(Cancelled)` if the
    /// token fired first.
    async fn request(
        &self,
        request: CreatePermissionRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError>;

    fn auto_approve_session(&self, session_id: &SessionId);

    /// Like [`request`](Self::request) but a denial is an error that ends the run.
    async fn require(
        &self,
        request: CreatePermissionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        if self.request(request, cancel).await? {
            Ok(())
        } else {
            Err(AgentError::PermissionDenied)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GrantKey {
    session_id: SessionId,
    tool_name: String,
    action: String,
    path: String,
}

/// In-process gate. Pending requests are published on a broadcast channel
/// for whatever front end is listening.
pub struct PermissionService {
    auto_approved: DashSet<SessionId>,
    session_grants: DashSet<GrantKey>,
    pending: DashMap<PermissionRequestId, (GrantKey, oneshot::Sender<bool>)>,
    requests: broadcast::Sender<PermissionRequest>,
}

impl Default for PermissionService {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionService {
    pub fn new() -> Self {
        let (requests, _) = broadcast::channel(64);
        Self {
            auto_approved: DashSet::new(),
            session_grants: DashSet::new(),
            pending: DashMap::new(),
            requests,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionRequest> {
        self.requests.subscribe()
    }

    pub fn grant(&self, id: &PermissionRequestId) -> bool {
        self.resolve(id, true, false)
    }

    /// Grant and remember the decision for the same tool, action and path
    /// in this session.
    pub fn grant_for_session(&self, id: &PermissionRequestId) -> bool {
        self.resolve(id, true, true)
    }

    pub fn deny(&self, id: &PermissionRequestId) -> bool {
        self.resolve(id, false, false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve(&self, id: &PermissionRequestId, granted: bool, remember: bool) -> bool {
        let Some((_, (key, tx))) = self.pending.remove(id) else {
            return false;
        };
        if remember {
            let _ = self.session_grants.insert(key);
        }
        tx.send(granted).is_ok()
    }
}

#[async_trait]
impl PermissionGate for PermissionService {
    async fn request(
        &self,
        request: CreatePermissionRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError> {
        if self.auto_approved.contains(&request.session_id) {
            return Ok(true);
        }
        let key = GrantKey {
            session_id: request.session_id.clone(),
            tool_name: request.tool_name.clone(),
            action: request.action.clone(),
            path: request.path.clone(),
        };
        if self.session_grants.contains(&key) {
            return Ok(true);
        }

        let id = PermissionRequestId::new();
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(id.clone(), (key, tx));
        debug!(request_id = %id, tool = %request.tool_name, "permission requested");
        let _ = self.requests.send(PermissionRequest {
            id: id.clone(),
            session_id: request.session_id,
            tool_call_id: request.tool_call_id,
            tool_name: request.tool_name,
            action: request.action,
            path: request.path,
            description: request.description,
            params: request.params,
        });

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = self.pending.remove(&id);
                Err(AgentError::Cancelled)
            }
            decision = rx => Ok(decision.unwrap_or(false)),
        }
    }

    fn auto_approve_session(&self, session_id: &SessionId) {
        let _ = self.auto_approved.insert(session_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn req(session: &SessionId) -> CreatePermissionRequest {
        CreatePermissionRequest {
            session_id: session.clone(),
            tool_call_id: "c1".into(),
            tool_name: "write".into(),
            action: "write".into(),
            path: "/tmp/out.txt".into(),
            description: "write a file".into(),
            params: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn grant_and_deny_resolve_pending_requests() {
        let service = Arc::new(PermissionService::new());
        let mut rx = service.subscribe();
        let session = SessionId::new();

        let waiter = {
            let service = Arc::clone(&service);
            let session = session.clone();
            tokio::spawn(async move { service.request(req(&session), &CancellationToken::new()).await })
        };
        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.tool_name, "write");
        assert!(service.grant(&pending.id));
        assert!(waiter.await.unwrap().unwrap());

        let waiter = {
            let service = Arc::clone(&service);
            let session = session.clone();
            tokio::spawn(async move { service.require(req(&session), &CancellationToken::new()).await })
        };
        let pending = rx.recv().await.unwrap();
        assert!(service.deny(&pending.id));
        assert_eq!(waiter.await.unwrap(), Err(AgentError::PermissionDenied));
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn auto_approved_session_skips_prompt() {
        let service = PermissionService::new();
        let session = SessionId::new();
        service.auto_approve_session(&session);
        assert!(service.request(req(&session), &CancellationToken::new()).await.unwrap());
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn session_grant_is_remembered() {
        let service = Arc::new(PermissionService::new());
        let mut rx = service.subscribe();
        let session = SessionId::new();
        let waiter = {
            let service = Arc::clone(&service);
            let session = session.clone();
            tokio::spawn(async move { service.request(req(&session), &CancellationToken::new()).await })
        };
        let pending = rx.recv().await.unwrap();
        assert!(service.grant_for_session(&pending.id));
        assert!(waiter.await.unwrap().unwrap());
        assert!(service.request(req(&session), &CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_abandons_request() {
        let service = PermissionService::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service.request(req(&SessionId::new()), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_request_id_is_ignored() {
        let service = PermissionService::new();
        assert!(!service.grant(&PermissionRequestId::new()));
    }
}
