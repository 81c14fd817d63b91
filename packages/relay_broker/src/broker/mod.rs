//! Connection broker: identity registration, rendezvous, and the handoff that
//! switches two accepted clients into relay mode.
//!
//! ```text
//! alice                       broker                        bob
//!   │ ConnectTo(bob) ───────────►│                            │
//!   │◄── IncomingConnection(ta) ─┼── IncomingConnection(tb) ─►│
//!   │ AcceptConnection(ta) ─────►│                            │
//!   │                            │◄──── AcceptConnection(tb) ─│
//!   │◄── InitializeConnection(ta)┼ InitializeConnection(tb) ─►│
//!   │◄═══════════════ raw relay bytes ═══════════════════════►│
//! ```

pub mod context;
pub mod pending;
pub mod registry;

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::session::remote::{PendingReply, RemoteHandle};
use crate::token::{EntropySource, OsEntropy, TOKEN_LEN, Token, random_bytes};

pub use context::{ClientContext, SessionMode};
use pending::{AcceptOutcome, PendingError, PendingTable, RejectOutcome};
use registry::ClientRegistry;

/// Message sent to an acceptor whose peer rejected afterwards.
pub const REJECTED_BY_SECOND: &str = "could not connect - rejected by second";
/// Message sent when a peer became unavailable during the handoff.
pub const PEER_UNAVAILABLE: &str = "could not connect - peer unavailable";

impl From<PendingError> for BrokerError {
    fn from(err: PendingError) -> Self {
        match err {
            PendingError::UnknownConnection => Self::UnknownConnection,
            PendingError::Rejected => Self::Rejected,
        }
    }
}

/// Shared broker state. One instance serves every connection.
pub struct Broker {
    clients: RwLock<ClientRegistry>,
    pending: Mutex<PendingTable<RemoteHandle>>,
    entropy: Arc<dyn EntropySource>,
    metrics: Arc<BrokerMetrics>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig, metrics: Arc<BrokerMetrics>) -> Self {
        Self::with_entropy(config, metrics, Arc::new(OsEntropy))
    }

    pub fn with_entropy(
        config: BrokerConfig,
        metrics: Arc<BrokerMetrics>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        Self {
            clients: RwLock::new(ClientRegistry::new()),
            pending: Mutex::new(PendingTable::new()),
            entropy,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    /// Protocol version handshake. Clears the handshake read deadline.
    pub async fn version(&self, ctx: &ClientContext, version: u8) {
        debug!(conn_id = %ctx.id(), version, "version handshake");
        ctx.clear_read_deadline().await;
    }

    /// Issue a fresh secret key. Neither input is checked.
    pub fn register(
        &self,
        app_id: &[u8],
        public_id: &[u8],
        _registration_key: &[u8],
    ) -> Result<[u8; TOKEN_LEN], BrokerError> {
        let secret = random_bytes::<TOKEN_LEN>(self.entropy.as_ref()).map_err(|e| {
            warn!(error = %e, "failed to generate secret key");
            BrokerError::from(e)
        })?;
        info!(
            app_id = %hex::encode(app_id),
            public_id = %hex::encode(public_id),
            "client registered"
        );
        Ok(secret)
    }

    /// Mark the connection authenticated and make it reachable under
    /// `public_id`. The secret key is not verified.
    pub async fn authenticate(
        &self,
        ctx: &ClientContext,
        app_id: Vec<u8>,
        public_id: Vec<u8>,
        _secret_key: &[u8],
    ) {
        let former_id = ctx.public_id().await.filter(|id| *id != public_id);
        {
            let mut clients = self.clients.write().await;
            let replaced = clients.store(&public_id, ctx.remote().clone());
            if let Some(previous) = replaced.filter(|p| !p.same_connection(ctx.remote())) {
                debug!(
                    conn_id = %ctx.id(),
                    previous = %previous.connection_id(),
                    "public id re-authenticated by another connection"
                );
            }
            // A connection is reachable under its latest identity only.
            if let Some(former_id) = former_id {
                if clients.evict(&former_id, ctx.id()) {
                    debug!(
                        conn_id = %ctx.id(),
                        former = %hex::encode(&former_id),
                        "dropped former public id"
                    );
                }
            }
        }
        info!(
            conn_id = %ctx.id(),
            public_id = %hex::encode(&public_id),
            "client authenticated"
        );
        ctx.authenticate(app_id, public_id).await;
        self.metrics.authenticated();
    }

    /// Start a rendezvous with the client registered under `remote_public_id`.
    ///
    /// Both sides are notified with their own token; notification failures are
    /// logged, not returned.
    pub async fn connect_to(
        &self,
        ctx: &ClientContext,
        remote_public_id: &[u8],
        correlation_id: u64,
    ) -> Result<(), BrokerError> {
        if !ctx.is_authenticated().await {
            return Err(BrokerError::NotAuthenticated);
        }
        let own_public_id = ctx.public_id().await.unwrap_or_default();

        let target = self
            .clients
            .read()
            .await
            .load(remote_public_id)
            .ok_or(BrokerError::UserNotFound)?;

        let (token_a, token_b) = self
            .pending
            .lock()
            .await
            .generate_pair(self.entropy.as_ref())
            .map_err(|e| {
                warn!(conn_id = %ctx.id(), error = %e, "failed to generate connection tokens");
                BrokerError::from(e)
            })?;

        info!(
            conn_id = %ctx.id(),
            target = %target.connection_id(),
            correlation_id,
            "connection requested"
        );
        self.metrics.connect_requested();

        let to_caller = ctx
            .remote()
            .incoming_connection(token_a, correlation_id, own_public_id.clone())
            .await;
        self.watch("IncomingConnection", ctx.remote(), to_caller);

        let to_target = target.incoming_connection(token_b, 0, own_public_id).await;
        self.watch("IncomingConnection", &target, to_target);

        Ok(())
    }

    /// Accept the pending connection behind `token`.
    ///
    /// Returns a handoff when this acceptance completes the pair; the session
    /// starts it after replying so the reply precedes the relay switch.
    pub async fn accept_connection(
        &self,
        ctx: &ClientContext,
        token: Token,
    ) -> Result<Option<RelayHandoff>, BrokerError> {
        let outcome = self
            .pending
            .lock()
            .await
            .accept(&token, ctx.remote().clone())?;

        match outcome {
            AcceptOutcome::FirstAccept => {
                debug!(conn_id = %ctx.id(), ?token, "first side accepted");
                Ok(None)
            }
            AcceptOutcome::Complete { first, first_token } => {
                info!(
                    conn_id = %ctx.id(),
                    peer = %first.connection_id(),
                    "both sides accepted"
                );
                Ok(Some(RelayHandoff {
                    first,
                    first_token,
                    second: ctx.remote().clone(),
                    second_token: token,
                    metrics: self.metrics.clone(),
                }))
            }
        }
    }

    /// Reject the pending connection behind `token`.
    pub async fn reject_connection(
        &self,
        ctx: &ClientContext,
        token: Token,
    ) -> Result<(), BrokerError> {
        let outcome = self.pending.lock().await.reject(&token)?;

        match outcome {
            RejectOutcome::Recorded => {
                debug!(conn_id = %ctx.id(), ?token, "connection rejected");
            }
            RejectOutcome::NotifyAcceptor {
                acceptor,
                acceptor_token,
            } => {
                info!(
                    conn_id = %ctx.id(),
                    peer = %acceptor.connection_id(),
                    "connection rejected after peer accepted"
                );
                let reply = acceptor
                    .error_connection(acceptor_token, REJECTED_BY_SECOND)
                    .await;
                self.watch("ErrorConnection", &acceptor, reply);
            }
        }
        Ok(())
    }

    /// Forget a closed connection.
    pub async fn connection_closed(&self, ctx: &ClientContext) {
        if !self.config.evict_on_disconnect {
            return;
        }
        let Some(public_id) = ctx.public_id().await else {
            return;
        };
        if self.clients.write().await.evict(&public_id, ctx.id()) {
            debug!(conn_id = %ctx.id(), "evicted registry entry");
        }
    }

    /// Drop every registry entry. Returns how many there were.
    pub async fn shutdown(&self) -> usize {
        let mut clients = self.clients.write().await;
        clients.drain().count()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn pending_tokens(&self) -> usize {
        self.pending.lock().await.token_count()
    }

    fn watch(&self, call: &'static str, remote: &RemoteHandle, reply: PendingReply) {
        watch_reply(call, remote, reply, self.metrics.clone());
    }
}

/// Log a callback that fails instead of returning it to anyone.
fn watch_reply(
    call: &'static str,
    remote: &RemoteHandle,
    reply: PendingReply,
    metrics: Arc<BrokerMetrics>,
) {
    let conn_id = remote.connection_id();
    tokio::spawn(async move {
        if let Err(e) = reply.wait().await {
            warn!(conn_id = %conn_id, call, error = %e, "failed to deliver callback");
            metrics.notification_failed();
        }
    });
}

/// Both sides accepted: tell each to switch to relay mode towards the other.
#[derive(Debug)]
pub struct RelayHandoff {
    first: RemoteHandle,
    first_token: Token,
    second: RemoteHandle,
    second_token: Token,
    metrics: Arc<BrokerMetrics>,
}

impl RelayHandoff {
    /// Switch both sides, or neither. A side that has disconnected or is
    /// already relaying abandons the handoff; the other side is told the peer
    /// is unavailable and stays in RPC mode.
    pub async fn start(self) {
        let first_claimed = self.first.is_connected() && self.first.reserve_relay();
        let second_claimed = self.second.is_connected() && self.second.reserve_relay();

        if !(first_claimed && second_claimed) {
            warn!(
                first = %self.first.connection_id(),
                second = %self.second.connection_id(),
                "relay handoff abandoned, a peer is unavailable"
            );
            for (remote, token, claimed) in [
                (&self.first, self.first_token, first_claimed),
                (&self.second, self.second_token, second_claimed),
            ] {
                if claimed {
                    remote.release_relay();
                    let reply = remote.error_connection(token, PEER_UNAVAILABLE).await;
                    watch_reply("ErrorConnection", remote, reply, self.metrics.clone());
                }
            }
            return;
        }

        let to_first = self
            .first
            .initialize_connection(self.first_token, self.second.clone())
            .await;
        watch_reply("InitializeConnection", &self.first, to_first, self.metrics.clone());

        let to_second = self
            .second
            .initialize_connection(self.second_token, self.first.clone())
            .await;
        watch_reply("InitializeConnection", &self.second, to_second, self.metrics.clone());
    }
}
