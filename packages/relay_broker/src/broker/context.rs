//! Per-connection state shared between the session and the broker.

use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::session::remote::RemoteHandle;

/// Which loop owns the connection's read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Reading frames and dispatching broker calls.
    Dispatching,
    /// Forwarding raw bytes to the peer connection `target`.
    Relaying { target: Uuid },
}

#[derive(Debug)]
struct ClientState {
    authenticated: bool,
    app_id: Vec<u8>,
    public_id: Option<Vec<u8>>,
    read_deadline: Option<Instant>,
    mode: SessionMode,
}

/// One live client connection.
pub struct ClientContext {
    id: Uuid,
    peer: String,
    remote: RemoteHandle,
    state: Mutex<ClientState>,
}

impl ClientContext {
    pub fn new(remote: RemoteHandle, peer: impl Into<String>, read_deadline: Option<Instant>) -> Self {
        Self {
            id: remote.connection_id(),
            peer: peer.into(),
            remote,
            state: Mutex::new(ClientState {
                authenticated: false,
                app_id: Vec::new(),
                public_id: None,
                read_deadline,
                mode: SessionMode::Dispatching,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn remote(&self) -> &RemoteHandle {
        &self.remote
    }

    /// Record the identity claimed by Authenticate.
    pub async fn authenticate(&self, app_id: Vec<u8>, public_id: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.authenticated = true;
        state.app_id = app_id;
        state.public_id = Some(public_id);
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.authenticated
    }

    pub async fn public_id(&self) -> Option<Vec<u8>> {
        self.state.lock().await.public_id.clone()
    }

    pub async fn app_id(&self) -> Vec<u8> {
        self.state.lock().await.app_id.clone()
    }

    pub async fn read_deadline(&self) -> Option<Instant> {
        self.state.lock().await.read_deadline
    }

    pub async fn clear_read_deadline(&self) {
        self.state.lock().await.read_deadline = None;
    }

    pub async fn mode(&self) -> SessionMode {
        self.state.lock().await.mode
    }

    pub async fn enter_relay(&self, target: Uuid) {
        self.state.lock().await.mode = SessionMode::Relaying { target };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(deadline: Option<Instant>) -> ClientContext {
        let (remote, _outlet) = RemoteHandle::channel(Uuid::new_v4(), 1);
        ClientContext::new(remote, "127.0.0.1:9", deadline)
    }

    #[tokio::test]
    async fn starts_unauthenticated_and_dispatching() {
        let ctx = context(None);
        assert!(!ctx.is_authenticated().await);
        assert!(ctx.public_id().await.is_none());
        assert_eq!(ctx.mode().await, SessionMode::Dispatching);
        assert_eq!(ctx.id(), ctx.remote().connection_id());
    }

    #[tokio::test]
    async fn authenticate_records_identity() {
        let ctx = context(None);
        ctx.authenticate(b"app".to_vec(), b"bob".to_vec()).await;
        assert!(ctx.is_authenticated().await);
        assert_eq!(ctx.public_id().await.as_deref(), Some(&b"bob"[..]));
        assert_eq!(ctx.app_id().await, b"app");
    }

    #[tokio::test]
    async fn deadline_clears() {
        let ctx = context(Some(Instant::now() + Duration::from_secs(10)));
        assert!(ctx.read_deadline().await.is_some());
        ctx.clear_read_deadline().await;
        ctx.clear_read_deadline().await;
        assert!(ctx.read_deadline().await.is_none());
    }

    #[tokio::test]
    async fn relay_mode_records_target() {
        let ctx = context(None);
        let target = Uuid::new_v4();
        ctx.enter_relay(target).await;
        assert_eq!(ctx.mode().await, SessionMode::Relaying { target });
    }
}
