//! Relay pump: forwards a connection's inbound bytes to its peer unchanged.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::remote::RemoteHandle;
use crate::metrics::BrokerMetrics;
use crate::transport::TransportRead;
use crate::transport::framing::FrameReader;

/// Why the pump stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The client finished sending (EOF).
    ClientFinished,
    /// Reading from the client failed.
    ReadFailed,
    /// The peer's data queue is closed.
    PeerGone,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub exit: RelayExit,
    pub forwarded: u64,
    /// The peer's writer accepted the close request.
    pub peer_notified: bool,
}

impl RelayOutcome {
    /// Whether the session can leave teardown to the peer closing back.
    ///
    /// Only a clean EOF with a live peer qualifies.
    pub fn awaits_peer(&self) -> bool {
        self.exit == RelayExit::ClientFinished && self.peer_notified
    }
}

/// Pump bytes from `frames`' transport into `target` until either side stops.
///
/// Bytes the frame reader had already buffered go first. On exit the peer's
/// writer is told to flush and close.
pub async fn pump<R: TransportRead>(
    frames: FrameReader<R>,
    target: &RemoteHandle,
    buffer_bytes: usize,
    cancel: &CancellationToken,
    metrics: &BrokerMetrics,
    conn_id: Uuid,
) -> RelayOutcome {
    let (mut reader, leftover) = frames.into_parts();
    let mut scratch = vec![0u8; buffer_bytes.max(1)];
    let mut next = (!leftover.is_empty()).then(|| leftover.freeze());
    let mut forwarded = 0u64;

    metrics.relay_started();
    info!(conn_id = %conn_id, target = %target.connection_id(), "relay started");

    let exit = loop {
        let chunk = match next.take() {
            Some(chunk) => chunk,
            None => {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break RelayExit::Cancelled,
                    read = reader.read(&mut scratch) => read,
                };
                match read {
                    Ok(0) => {
                        debug!(conn_id = %conn_id, "client finished sending");
                        break RelayExit::ClientFinished;
                    }
                    Ok(n) => Bytes::copy_from_slice(&scratch[..n]),
                    Err(e) => {
                        debug!(conn_id = %conn_id, error = %e, "relay read failed");
                        break RelayExit::ReadFailed;
                    }
                }
            }
        };

        let len = chunk.len() as u64;
        let sent = tokio::select! {
            _ = cancel.cancelled() => break RelayExit::Cancelled,
            sent = target.send_raw(chunk) => sent,
        };
        if sent.is_err() {
            debug!(conn_id = %conn_id, "relay peer is gone");
            break RelayExit::PeerGone;
        }
        forwarded += len;
        metrics.bytes_forwarded(len);
    };

    let peer_notified = target.close_relay().await;
    metrics.relay_finished();
    info!(conn_id = %conn_id, forwarded, ?exit, "relay finished");
    RelayOutcome {
        exit,
        forwarded,
        peer_notified,
    }
}
