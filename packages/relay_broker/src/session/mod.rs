//! Per-connection RPC session.
//!
//! A session owns its transport. The read side runs the dispatch loop until
//! the client acknowledges InitializeConnection, then hands the same transport
//! (and any bytes already buffered) to the relay pump. The write side is a
//! separate task draining the connection's [`Outlet`]: control frames first,
//! then raw relay data once the InitializeConnection frame has been written.

pub mod dispatch;
pub mod protocol;
pub mod relay;
pub mod remote;

use std::sync::Arc;

use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, ClientContext};
use crate::config::SessionConfig;
use crate::transport::framing::{FrameError, FrameReader, encode_frame};
use crate::transport::{TransportRead, TransportWrite};
use dispatch::{Dispatched, dispatch_call};
use protocol::ClientFrame;
use remote::{CallCompletion, Outlet, RelayChunk, RemoteHandle};

/// Serve one client connection until it closes or `shutdown` fires.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    peer: String,
    broker: Arc<Broker>,
    config: SessionConfig,
    shutdown: CancellationToken,
) where
    R: TransportRead,
    W: TransportWrite,
{
    let (remote, outlet) = RemoteHandle::channel(Uuid::new_v4(), config.relay_queue_depth);
    let deadline = config.handshake_timeout.map(|t| Instant::now() + t);
    let ctx = ClientContext::new(remote.clone(), peer, deadline);
    let conn_id = ctx.id();
    let cancel = shutdown.child_token();

    broker.metrics().connection_opened();
    info!(conn_id = %conn_id, peer = %ctx.peer(), "client connected");

    let writer_task = tokio::spawn(write_loop(writer, outlet, cancel.clone(), conn_id));
    let frames = FrameReader::new(reader, config.max_frame_bytes);

    match dispatch_loop(frames, &ctx, &broker, &cancel).await {
        DispatchExit::Relay { frames, target } => {
            ctx.enter_relay(target.connection_id()).await;
            let outcome = relay::pump(
                frames,
                &target,
                config.relay_buffer_bytes,
                &cancel,
                broker.metrics(),
                conn_id,
            )
            .await;
            // After a clean EOF the writer keeps flushing until the peer's
            // pump closes us; otherwise nobody will.
            if !outcome.awaits_peer() {
                cancel.cancel();
            }
        }
        DispatchExit::Closed => cancel.cancel(),
    }

    for peer in remote.fail_pending().await {
        peer.close_relay().await;
    }
    if let Err(e) = writer_task.await {
        error!(conn_id = %conn_id, error = %e, "writer task panicked");
    }

    broker.connection_closed(&ctx).await;
    broker.metrics().connection_closed();
    let app_id = ctx.app_id().await;
    let mode = ctx.mode().await;
    info!(
        conn_id = %conn_id,
        app_id = %hex::encode(app_id),
        mode = ?mode,
        "client disconnected"
    );
}

enum DispatchExit<R> {
    Closed,
    Relay {
        frames: FrameReader<R>,
        target: RemoteHandle,
    },
}

enum ReadFailure {
    Deadline,
    Frame(FrameError),
}

async fn read_frame<R: TransportRead>(
    frames: &mut FrameReader<R>,
    deadline: Option<Instant>,
) -> Result<Option<ClientFrame>, ReadFailure> {
    match deadline {
        Some(deadline) => timeout_at(deadline, frames.next_frame())
            .await
            .map_err(|_| ReadFailure::Deadline)?
            .map_err(ReadFailure::Frame),
        None => frames.next_frame().await.map_err(ReadFailure::Frame),
    }
}

async fn dispatch_loop<R: TransportRead>(
    mut frames: FrameReader<R>,
    ctx: &ClientContext,
    broker: &Broker,
    cancel: &CancellationToken,
) -> DispatchExit<R> {
    let conn_id = ctx.id();
    loop {
        let deadline = ctx.read_deadline().await;
        let next = tokio::select! {
            _ = cancel.cancelled() => return DispatchExit::Closed,
            next = read_frame(&mut frames, deadline) => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(conn_id = %conn_id, "client closed connection");
                return DispatchExit::Closed;
            }
            Err(ReadFailure::Deadline) => {
                warn!(conn_id = %conn_id, "no version handshake before deadline");
                return DispatchExit::Closed;
            }
            Err(ReadFailure::Frame(e)) => {
                warn!(conn_id = %conn_id, error = %e, "failed to read frame");
                return DispatchExit::Closed;
            }
        };

        match frame {
            ClientFrame::Call { id, call } => {
                debug!(conn_id = %conn_id, id, method = call.method(), "call");
                let Dispatched { result, handoff } = dispatch_call(broker, ctx, call).await;
                if ctx.remote().reply(id, result).is_err() {
                    return DispatchExit::Closed;
                }
                if let Some(handoff) = handoff {
                    handoff.start().await;
                }
            }
            ClientFrame::CallbackResult { id, error } => {
                match ctx.remote().complete(id, error).await {
                    CallCompletion::Done => {}
                    CallCompletion::Unknown => {
                        debug!(conn_id = %conn_id, id, "acknowledgement for unknown callback");
                    }
                    CallCompletion::EnterRelay(target) => {
                        return DispatchExit::Relay { frames, target };
                    }
                    CallCompletion::RelayDeclined(peer) => {
                        warn!(conn_id = %conn_id, "client declined relay, closing");
                        peer.close_relay().await;
                        return DispatchExit::Closed;
                    }
                }
            }
        }
    }
}

/// Drain the outlet into the transport.
///
/// Relay data is held back until the InitializeConnection frame is on the
/// wire; control frames after that point are dropped since the client is no
/// longer parsing frames.
async fn write_loop<W: TransportWrite>(
    mut writer: W,
    mut outlet: Outlet,
    cancel: CancellationToken,
    conn_id: Uuid,
) {
    let mut raw = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(frame) = outlet.control.recv() => {
                if raw {
                    debug!(conn_id = %conn_id, "dropping frame for relaying connection");
                    continue;
                }
                let starts_relay = frame.starts_relay();
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(conn_id = %conn_id, error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = writer.write(&bytes).await {
                    debug!(conn_id = %conn_id, error = %e, "write failed");
                    break;
                }
                raw = starts_relay;
            }
            Some(chunk) = outlet.data.recv(), if raw => match chunk {
                RelayChunk::Data(bytes) => {
                    if let Err(e) = writer.write(&bytes).await {
                        debug!(conn_id = %conn_id, error = %e, "relay write failed");
                        break;
                    }
                }
                RelayChunk::Close => {
                    debug!(conn_id = %conn_id, "peer closed relay");
                    break;
                }
            },
            else => break,
        }
    }
    if let Err(e) = writer.close().await {
        debug!(conn_id = %conn_id, error = %e, "close failed");
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::config::BrokerConfig;
    use crate::metrics::BrokerMetrics;
    use crate::session::protocol::{BrokerCall, CallResult, RemoteCall, ServerFrame};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct ChanRead(mpsc::UnboundedReceiver<Vec<u8>>, Vec<u8>);

    impl TransportRead for ChanRead {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.1.is_empty() {
                match self.0.recv().await {
                    Some(data) => self.1 = data,
                    None => return Ok(0),
                }
            }
            let n = buf.len().min(self.1.len());
            buf[..n].copy_from_slice(&self.1[..n]);
            self.1.drain(..n);
            Ok(n)
        }
    }

    struct ChanWrite(mpsc::UnboundedSender<Vec<u8>>);

    impl TransportWrite for ChanWrite {
        async fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.0
                .send(data.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        to_server: mpsc::UnboundedSender<Vec<u8>>,
        from_server: FrameReader<ChanRead>,
        session: tokio::task::JoinHandle<()>,
    }

    fn start(broker: Arc<Broker>, config: SessionConfig) -> Harness {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = tokio::spawn(run_session(
            ChanRead(in_rx, Vec::new()),
            ChanWrite(out_tx),
            "test".into(),
            broker,
            config,
            CancellationToken::new(),
        ));
        Harness {
            to_server: in_tx,
            from_server: FrameReader::new(ChanRead(out_rx, Vec::new()), usize::MAX),
            session,
        }
    }

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(
            BrokerConfig::default(),
            Arc::new(BrokerMetrics::new()),
        ))
    }

    impl Harness {
        fn call(&self, id: u64, call: BrokerCall) {
            let frame = encode_frame(&ClientFrame::Call { id, call }).unwrap();
            self.to_server.send(frame.to_vec()).unwrap();
        }

        fn ack(&self, id: u64) {
            let frame = encode_frame(&ClientFrame::CallbackResult { id, error: None }).unwrap();
            self.to_server.send(frame.to_vec()).unwrap();
        }

        /// Next callback, skipping successful replies.
        async fn next_callback(&mut self) -> (u64, RemoteCall) {
            loop {
                match self.next().await.unwrap() {
                    ServerFrame::Callback { id, call } => return (id, call),
                    ServerFrame::Reply {
                        result: CallResult::Error(e),
                        ..
                    } => panic!("call failed: {e:?}"),
                    ServerFrame::Reply { .. } => {}
                }
            }
        }

        async fn next(&mut self) -> Option<ServerFrame> {
            timeout(TEST_TIMEOUT, self.from_server.next_frame())
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn replies_in_order_with_matching_ids() {
        let broker = broker();
        let mut h = start(broker.clone(), SessionConfig::default());
        h.call(1, BrokerCall::Version { version: 1 });
        h.call(
            2,
            BrokerCall::ConnectTo {
                public_id: b"bob".to_vec(),
                correlation_id: 0,
            },
        );

        match h.next().await.unwrap() {
            ServerFrame::Reply { id, result } => {
                assert_eq!(id, 1);
                assert!(matches!(result, CallResult::Ok { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        match h.next().await.unwrap() {
            ServerFrame::Reply {
                id,
                result: CallResult::Error(e),
            } => {
                assert_eq!(id, 2);
                assert_eq!(e.code, "not_authenticated");
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(h.to_server);
        timeout(TEST_TIMEOUT, h.session).await.unwrap().unwrap();
        assert_eq!(broker.metrics().snapshot().connections.active, 0);
    }

    #[tokio::test]
    async fn handshake_deadline_closes_connection() {
        let config = SessionConfig {
            handshake_timeout: Some(Duration::from_millis(50)),
            ..SessionConfig::default()
        };
        let h = start(broker(), config);
        timeout(TEST_TIMEOUT, h.session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn version_lifts_handshake_deadline() {
        let config = SessionConfig {
            handshake_timeout: Some(Duration::from_millis(50)),
            ..SessionConfig::default()
        };
        let mut h = start(broker(), config);
        h.call(1, BrokerCall::Version { version: 1 });
        assert!(h.next().await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!h.session.is_finished());
    }

    #[tokio::test]
    async fn disconnect_evicts_registration() {
        let broker = broker();
        let mut h = start(broker.clone(), SessionConfig::default());
        h.call(
            1,
            BrokerCall::Authenticate {
                app_id: b"app".to_vec(),
                public_id: b"bob".to_vec(),
                secret_key: vec![],
            },
        );
        h.next().await.unwrap();
        assert_eq!(broker.client_count().await, 1);

        drop(h.to_server);
        timeout(TEST_TIMEOUT, h.session).await.unwrap().unwrap();
        assert_eq!(broker.client_count().await, 0);
    }

    #[tokio::test]
    async fn relay_ends_when_peer_departed() {
        let broker = broker();

        // 1. A bare peer registered as bob, with no session behind it
        let (peer_remote, mut peer_outlet) = RemoteHandle::channel(Uuid::new_v4(), 8);
        let peer = ClientContext::new(peer_remote, "peer", None);
        broker
            .authenticate(&peer, b"app".to_vec(), b"bob".to_vec(), b"")
            .await;

        // 2. Alice signs in over a real session and asks for bob
        let mut h = start(broker.clone(), SessionConfig::default());
        h.call(
            1,
            BrokerCall::Authenticate {
                app_id: b"app".to_vec(),
                public_id: b"alice".to_vec(),
                secret_key: vec![],
            },
        );
        h.call(
            2,
            BrokerCall::ConnectTo {
                public_id: b"bob".to_vec(),
                correlation_id: 5,
            },
        );
        let alice_token = match h.next_callback().await {
            (id, RemoteCall::IncomingConnection { token, .. }) => {
                h.ack(id);
                token
            }
            other => panic!("unexpected {other:?}"),
        };
        let bob_token = match peer_outlet.control.recv().await.unwrap() {
            ServerFrame::Callback {
                call: RemoteCall::IncomingConnection { token, .. },
                ..
            } => token,
            other => panic!("unexpected {other:?}"),
        };

        // 3. Bob accepts first, then alice completes the pair
        assert!(
            broker
                .accept_connection(&peer, bob_token)
                .await
                .unwrap()
                .is_none()
        );
        h.call(3, BrokerCall::AcceptConnection { token: alice_token });
        let init_id = match h.next_callback().await {
            (id, RemoteCall::InitializeConnection { token }) => {
                assert_eq!(token, alice_token);
                id
            }
            other => panic!("unexpected {other:?}"),
        };

        // 4. Bob goes away before alice switches; alice relays into nothing
        drop(peer_outlet);
        h.ack(init_id);
        h.to_server.send(b"hello".to_vec()).unwrap();

        // 5. Alice's session must end on its own, without her closing
        timeout(TEST_TIMEOUT, h.session).await.unwrap().unwrap();
        assert_eq!(broker.metrics().snapshot().connections.active, 0);
        assert_eq!(broker.metrics().snapshot().relays.active, 0);
    }
}
