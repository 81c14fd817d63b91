//! WebSocket adapters.
//!
//! Inbound binary and text messages are concatenated into one continuous byte
//! stream; each outbound write becomes a single binary message. The same
//! adapters serve both the axum server socket and the tokio-tungstenite client
//! socket via [`WsMessage`].

use std::io;
use std::marker::PhantomData;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};

use super::{TransportRead, TransportWrite};

/// What a received WebSocket message means for the byte stream.
pub enum Payload {
    Data(Bytes),
    Close,
    /// Ping/pong and other frames with no stream content.
    Control,
}

/// Message type of a WebSocket implementation.
pub trait WsMessage: Send + 'static {
    fn into_payload(self) -> Payload;
    fn binary(data: Bytes) -> Self;
}

impl WsMessage for axum::extract::ws::Message {
    fn into_payload(self) -> Payload {
        use axum::extract::ws::Message;
        match self {
            Message::Binary(data) => Payload::Data(data),
            Message::Text(text) => Payload::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Close(_) => Payload::Close,
            Message::Ping(_) | Message::Pong(_) => Payload::Control,
        }
    }

    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn into_payload(self) -> Payload {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Binary(data) => Payload::Data(data),
            Message::Text(text) => Payload::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Close(_) => Payload::Close,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Payload::Control,
        }
    }

    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// Read half: a message stream presented as bytes.
pub struct WsReader<S> {
    stream: S,
    pending: Bytes,
    closed: bool,
}

impl<S> WsReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
            closed: false,
        }
    }
}

impl<S, M, E> TransportRead for WsReader<S>
where
    S: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Returns what is already available instead of waiting to fill `buf`.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            if self.closed {
                return Ok(0);
            }
            match self.stream.next().await {
                None => self.closed = true,
                Some(Err(e)) => return Err(io::Error::other(e)),
                Some(Ok(msg)) => match msg.into_payload() {
                    Payload::Data(data) => self.pending = data,
                    Payload::Close => self.closed = true,
                    Payload::Control => {}
                },
            }
        }
        let n = buf.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}

/// Write half: every write is sent as one binary message.
pub struct WsWriter<S, M> {
    sink: S,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> WsWriter<S, M> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            _message: PhantomData,
        }
    }
}

impl<S, M, E> TransportWrite for WsWriter<S, M>
where
    S: Sink<M, Error = E> + Unpin + Send + 'static,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.sink
            .send(M::binary(Bytes::copy_from_slice(data)))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.sink.close().await.map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use futures::stream;

    fn reader(messages: Vec<Message>) -> WsReader<impl Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static> {
        WsReader::new(stream::iter(messages.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn message_boundaries_are_invisible() {
        let mut r = reader(vec![
            Message::Binary(Bytes::from_static(b"hel")),
            Message::Ping(Bytes::new()),
            Message::Binary(Bytes::from_static(b"lo")),
        ]);
        let mut out = Vec::new();
        let mut buf = [0u8; 2];
        loop {
            let n = r.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn text_is_treated_as_bytes() {
        let mut r = reader(vec![Message::Text("hi".into())]);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }

    #[tokio::test]
    async fn close_message_ends_stream() {
        let mut r = reader(vec![
            Message::Close(None),
            Message::Binary(Bytes::from_static(b"late")),
        ]);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).await.unwrap(), 0);
        assert_eq!(r.read(&mut buf).await.unwrap(), 0);
    }
}
