//! Client side of the broker protocol.
//!
//! [`BrokerClient`] issues broker calls and surfaces callbacks as
//! [`ClientEvent`]s, acknowledging each one automatically. When the broker
//! sends InitializeConnection the client acknowledges it, stops parsing
//! frames, and the connection can be taken over as a raw [`RelayStream`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::{SplitSink, SplitStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ErrorResponse;
use crate::session::protocol::{
    BrokerCall, CallResult, CallValue, ClientFrame, RemoteCall, ServerFrame,
};
use crate::token::{TOKEN_LEN, Token};
use crate::transport::framing::{DEFAULT_MAX_FRAME, FrameError, FrameReader, encode_frame};
use crate::transport::websocket::{WsReader, WsWriter};
use crate::transport::{TransportRead, TransportWrite};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{message}")]
    Broker { code: String, message: String },

    #[error("connection to broker closed")]
    Closed,

    #[error("unexpected reply from broker")]
    UnexpectedReply,
}

impl From<ErrorResponse> for ClientError {
    fn from(err: ErrorResponse) -> Self {
        Self::Broker {
            code: err.code,
            message: err.message,
        }
    }
}

impl ClientError {
    /// Error code when the broker refused the call.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Broker { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

/// Callbacks received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    IncomingConnection {
        token: Token,
        correlation_id: u64,
        initiator: Vec<u8>,
    },
    ConnectionError {
        token: Token,
        message: String,
    },
    /// The connection now carries raw relay bytes; call
    /// [`BrokerClient::into_relay`].
    RelayReady {
        token: Token,
    },
}

struct Shared<W> {
    writer: Mutex<W>,
    calls: Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
}

impl<W: TransportWrite> Shared<W> {
    async fn send(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let bytes = encode_frame(frame)?;
        self.writer.lock().await.write(&bytes).await?;
        Ok(())
    }
}

type Handover<R> = (R, BytesMut);

/// A connection to the broker in RPC mode.
pub struct BrokerClient<R, W> {
    shared: Arc<Shared<W>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    handover: oneshot::Receiver<Handover<R>>,
    /// Stops the read task, releasing the transport, when the client is dropped.
    _reader: DropGuard,
}

pub type TcpBrokerClient = BrokerClient<OwnedReadHalf, OwnedWriteHalf>;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsBrokerClient =
    BrokerClient<WsReader<SplitStream<WsStream>>, WsWriter<SplitSink<WsStream, Message>, Message>>;

impl TcpBrokerClient {
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }
}

impl WsBrokerClient {
    /// Connect to a broker WebSocket endpoint such as `ws://host:7332/`.
    pub async fn connect_ws(url: &str) -> Result<Self, ClientError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, stream) = socket.split();
        Ok(Self::new(WsReader::new(stream), WsWriter::new(sink)))
    }
}

impl<R: TransportRead, W: TransportWrite> BrokerClient<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            calls: Mutex::new(HashMap::new()),
        });
        let (events_tx, events) = mpsc::unbounded_channel();
        let (handover_tx, handover) = oneshot::channel();
        let stop = CancellationToken::new();
        tokio::spawn(read_loop(
            FrameReader::new(reader, DEFAULT_MAX_FRAME),
            Arc::downgrade(&shared),
            events_tx,
            handover_tx,
            stop.clone(),
        ));
        Self {
            shared,
            next_id: AtomicU64::new(1),
            events,
            handover,
            _reader: stop.drop_guard(),
        }
    }

    async fn call(&self, call: BrokerCall) -> Result<CallValue, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.calls.lock().await.insert(id, tx);
        if let Err(e) = self.shared.send(&ClientFrame::Call { id, call }).await {
            self.shared.calls.lock().await.remove(&id);
            return Err(e);
        }
        match rx.await.map_err(|_| ClientError::Closed)? {
            CallResult::Ok { value } => Ok(value),
            CallResult::Error(e) => Err(e.into()),
        }
    }

    async fn call_unit(&self, call: BrokerCall) -> Result<(), ClientError> {
        match self.call(call).await? {
            CallValue::Unit => Ok(()),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn version(&self, version: u8) -> Result<(), ClientError> {
        self.call_unit(BrokerCall::Version { version }).await
    }

    pub async fn register(
        &self,
        app_id: &[u8],
        public_id: &[u8],
        registration_key: &[u8],
    ) -> Result<[u8; TOKEN_LEN], ClientError> {
        let call = BrokerCall::Register {
            app_id: app_id.to_vec(),
            public_id: public_id.to_vec(),
            registration_key: registration_key.to_vec(),
        };
        match self.call(call).await? {
            CallValue::SecretKey { secret_key } => Ok(secret_key),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn authenticate(
        &self,
        app_id: &[u8],
        public_id: &[u8],
        secret_key: &[u8],
    ) -> Result<(), ClientError> {
        self.call_unit(BrokerCall::Authenticate {
            app_id: app_id.to_vec(),
            public_id: public_id.to_vec(),
            secret_key: secret_key.to_vec(),
        })
        .await
    }

    pub async fn connect_to(&self, public_id: &[u8], correlation_id: u64) -> Result<(), ClientError> {
        self.call_unit(BrokerCall::ConnectTo {
            public_id: public_id.to_vec(),
            correlation_id,
        })
        .await
    }

    pub async fn accept_connection(&self, token: Token) -> Result<(), ClientError> {
        self.call_unit(BrokerCall::AcceptConnection { token }).await
    }

    pub async fn reject_connection(&self, token: Token) -> Result<(), ClientError> {
        self.call_unit(BrokerCall::RejectConnection { token }).await
    }

    /// Next callback from the broker, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Wait for the relay switch and take over the connection.
    pub async fn into_relay(self) -> Result<RelayStream<R, W>, ClientError> {
        let (reader, leftover) = self.handover.await.map_err(|_| ClientError::Closed)?;
        Ok(RelayStream {
            reader,
            pending: leftover.freeze(),
            shared: self.shared,
        })
    }
}

async fn read_loop<R: TransportRead, W: TransportWrite>(
    mut frames: FrameReader<R>,
    shared: Weak<Shared<W>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    handover: oneshot::Sender<Handover<R>>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = frames.next_frame::<ServerFrame>() => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "broker connection failed");
                break;
            }
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match frame {
            ServerFrame::Reply { id, result } => {
                if let Some(slot) = shared.calls.lock().await.remove(&id) {
                    let _ = slot.send(result);
                }
            }
            ServerFrame::Callback { id, call } => {
                let ack = ClientFrame::CallbackResult { id, error: None };
                if let Err(e) = shared.send(&ack).await {
                    debug!(error = %e, "failed to acknowledge callback");
                    break;
                }
                match call {
                    RemoteCall::IncomingConnection {
                        token,
                        correlation_id,
                        initiator,
                    } => {
                        let _ = events.send(ClientEvent::IncomingConnection {
                            token,
                            correlation_id,
                            initiator,
                        });
                    }
                    RemoteCall::ErrorConnection { token, message } => {
                        let _ = events.send(ClientEvent::ConnectionError { token, message });
                    }
                    RemoteCall::InitializeConnection { token } => {
                        // Calls still in flight will never be answered.
                        shared.calls.lock().await.clear();
                        let _ = handover.send(frames.into_parts());
                        let _ = events.send(ClientEvent::RelayReady { token });
                        return;
                    }
                }
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.calls.lock().await.clear();
    }
}

/// Raw byte stream to the relay peer.
pub struct RelayStream<R, W> {
    reader: R,
    pending: Bytes,
    shared: Arc<Shared<W>>,
}

impl<R: TransportRead, W: TransportWrite> RelayStream<R, W> {
    /// Read available bytes. `Ok(0)` means the relay closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            let chunk = self.pending.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            return Ok(n);
        }
        self.reader.read(buf).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }

    /// Read until the relay closes.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.shared.writer.lock().await.write(data).await
    }

    /// Close the sending direction.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shared.writer.lock().await.close().await
    }
}
