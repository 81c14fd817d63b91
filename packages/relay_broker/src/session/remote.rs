//! Remote capability handle: the broker's way of calling a connected client.
//!
//! A [`RemoteHandle`] is a cheap clone around the outbound side of one
//! connection. Callbacks are queued as control frames and answered by the
//! client's `CallbackResult`; each call returns a [`PendingReply`] that
//! resolves with the acknowledgement, or with [`RemoteError::Disconnected`]
//! once the connection is gone.
//!
//! Relay data uses a separate bounded queue so a slow reader applies
//! backpressure to the pump feeding it, while control frames never block.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use super::protocol::{CallResult, RemoteCall, ServerFrame};
use crate::token::Token;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("client disconnected")]
    Disconnected,

    #[error("client answered with an error: {0}")]
    Refused(String),

    #[error("client is switching to relay mode")]
    Relaying,
}

/// Unit of relay data queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayChunk {
    Data(Bytes),
    /// The peer side of the relay is done; flush and close.
    Close,
}

/// Receiving ends drained by the connection's writer task.
pub struct Outlet {
    pub control: mpsc::UnboundedReceiver<ServerFrame>,
    pub data: mpsc::Receiver<RelayChunk>,
}

/// Outstanding callback awaiting the client's acknowledgement.
struct PendingCall {
    reply: oneshot::Sender<Result<(), RemoteError>>,
    /// Set for InitializeConnection: where this connection relays once it acks.
    relay_to: Option<RemoteHandle>,
}

struct Link {
    connection_id: Uuid,
    control: mpsc::UnboundedSender<ServerFrame>,
    data: mpsc::Sender<RelayChunk>,
    calls: Mutex<HashMap<u64, PendingCall>>,
    next_call: AtomicU64,
    relaying: AtomicBool,
}

/// Handle for invoking a connected client's exported operations.
#[derive(Clone)]
pub struct RemoteHandle {
    link: Arc<Link>,
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("connection_id", &self.link.connection_id)
            .finish()
    }
}

/// Future result of a callback.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<(), RemoteError>>,
}

impl PendingReply {
    fn failed(err: RemoteError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }

    pub async fn wait(self) -> Result<(), RemoteError> {
        self.rx.await.unwrap_or(Err(RemoteError::Disconnected))
    }
}

/// What the session should do after a callback was acknowledged.
#[derive(Debug)]
pub enum CallCompletion {
    /// Ordinary acknowledgement.
    Done,
    /// InitializeConnection acknowledged: relay to this peer.
    EnterRelay(RemoteHandle),
    /// InitializeConnection answered with an error.
    RelayDeclined(RemoteHandle),
    /// No such outstanding call.
    Unknown,
}

impl RemoteHandle {
    /// Create a handle plus the receiving ends for the connection's writer.
    /// Relay data is bounded at `queue_depth` chunks.
    pub fn channel(connection_id: Uuid, queue_depth: usize) -> (Self, Outlet) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(queue_depth.max(1));
        let handle = Self {
            link: Arc::new(Link {
                connection_id,
                control: control_tx,
                data: data_tx,
                calls: Mutex::new(HashMap::new()),
                next_call: AtomicU64::new(1),
                relaying: AtomicBool::new(false),
            }),
        };
        (
            handle,
            Outlet {
                control: control_rx,
                data: data_rx,
            },
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.link.connection_id
    }

    pub fn same_connection(&self, other: &RemoteHandle) -> bool {
        Arc::ptr_eq(&self.link, &other.link)
    }

    /// Whether the connection's writer is still draining control frames.
    pub fn is_connected(&self) -> bool {
        !self.link.control.is_closed()
    }

    pub fn is_relaying(&self) -> bool {
        self.link.relaying.load(Ordering::Acquire)
    }

    /// Claim this connection for a relay. Fails if it is already claimed.
    pub fn reserve_relay(&self) -> bool {
        self.link
            .relaying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a [`reserve_relay`](Self::reserve_relay) that was not followed by
    /// InitializeConnection.
    pub fn release_relay(&self) {
        self.link.relaying.store(false, Ordering::Release);
    }

    pub async fn incoming_connection(
        &self,
        token: Token,
        correlation_id: u64,
        initiator: Vec<u8>,
    ) -> PendingReply {
        if self.is_relaying() {
            return PendingReply::failed(RemoteError::Relaying);
        }
        self.issue(
            RemoteCall::IncomingConnection {
                token,
                correlation_id,
                initiator,
            },
            None,
        )
        .await
    }

    pub async fn error_connection(&self, token: Token, message: impl Into<String>) -> PendingReply {
        if self.is_relaying() {
            return PendingReply::failed(RemoteError::Relaying);
        }
        self.issue(
            RemoteCall::ErrorConnection {
                token,
                message: message.into(),
            },
            None,
        )
        .await
    }

    /// Tell the client to switch to relay mode towards `relay_to`.
    ///
    /// The caller must hold a [`reserve_relay`](Self::reserve_relay) claim.
    pub async fn initialize_connection(&self, token: Token, relay_to: RemoteHandle) -> PendingReply {
        self.issue(RemoteCall::InitializeConnection { token }, Some(relay_to))
            .await
    }

    async fn issue(&self, call: RemoteCall, relay_to: Option<RemoteHandle>) -> PendingReply {
        let id = self.link.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.link.calls.lock().await.insert(
            id,
            PendingCall {
                reply: tx,
                relay_to,
            },
        );
        if self.link.control.send(ServerFrame::Callback { id, call }).is_err() {
            // Dropping the entry fails the reply.
            self.link.calls.lock().await.remove(&id);
        }
        PendingReply { rx }
    }

    /// Queue the reply to one of the client's calls.
    pub fn reply(&self, id: u64, result: CallResult) -> Result<(), RemoteError> {
        self.link
            .control
            .send(ServerFrame::Reply { id, result })
            .map_err(|_| RemoteError::Disconnected)
    }

    /// Resolve an outstanding callback with the client's answer.
    pub async fn complete(&self, id: u64, error: Option<String>) -> CallCompletion {
        let Some(call) = self.link.calls.lock().await.remove(&id) else {
            return CallCompletion::Unknown;
        };
        let result = match error {
            None => Ok(()),
            Some(message) => Err(RemoteError::Refused(message)),
        };
        let accepted = result.is_ok();
        let _ = call.reply.send(result);
        match call.relay_to {
            Some(peer) if accepted => CallCompletion::EnterRelay(peer),
            Some(peer) => CallCompletion::RelayDeclined(peer),
            None => CallCompletion::Done,
        }
    }

    /// Fail every outstanding callback. Returns the relay peers this
    /// connection had been told to relay to but never acknowledged.
    pub async fn fail_pending(&self) -> Vec<RemoteHandle> {
        let calls: Vec<PendingCall> = self.link.calls.lock().await.drain().map(|(_, c)| c).collect();
        calls.into_iter().filter_map(|c| c.relay_to).collect()
    }

    /// Queue relay bytes, waiting while the queue is full.
    pub async fn send_raw(&self, data: Bytes) -> Result<(), RemoteError> {
        self.link
            .data
            .send(RelayChunk::Data(data))
            .await
            .map_err(|_| RemoteError::Disconnected)
    }

    /// Ask this connection's writer to flush pending relay data and close.
    /// Returns false if the writer is already gone.
    pub async fn close_relay(&self) -> bool {
        self.link.data.send(RelayChunk::Close).await.is_ok()
    }
}
