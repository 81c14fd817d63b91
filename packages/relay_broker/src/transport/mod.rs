//! Byte-stream transports the broker can serve sessions over.
//!
//! A session only needs to read bytes, write bytes, and close. TCP socket
//! halves implement this directly; WebSocket connections are adapted so that
//! message boundaries are invisible to the reader.

use std::future::Future;
use std::io;

pub mod framing;
pub mod tcp;
pub mod websocket;

/// Read half of a transport.
pub trait TransportRead: Send + 'static {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Write half of a transport.
pub trait TransportWrite: Send + 'static {
    /// Write all of `data`.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and close the write direction.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}
