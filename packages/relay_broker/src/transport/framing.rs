//! Length-prefixed JSON frames over a byte transport.
//!
//! Wire format: `[4-byte big-endian length][JSON payload]`
//!
//! The reader keeps whatever it over-read past the last frame so a session can
//! hand those bytes to the relay pump unchanged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::TransportRead;

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialize `value` into a complete frame, prefix included.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes, FrameError> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32(len);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder over a [`TransportRead`].
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    scratch: Vec<u8>,
    max_frame: usize,
}

impl<R: TransportRead> FrameReader<R> {
    pub fn new(reader: R, max_frame: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::new(),
            scratch: vec![0; READ_CHUNK],
            max_frame,
        }
    }

    /// Read the next well-formed frame.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between frames. Frames
    /// that are not valid JSON for `T` are logged and skipped; an oversized
    /// length prefix is fatal since the stream can no longer be resynchronized.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        loop {
            while let Some(payload) = self.take_frame()? {
                match serde_json::from_slice::<T>(&payload) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        warn!(
                            error = %e,
                            len = payload.len(),
                            "malformed frame, skipping"
                        );
                    }
                }
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Truncated {
                    buffered: self.buf.len(),
                });
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Give back the transport and any bytes read past the last frame.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.reader, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    use serde::Deserialize;

    /// Reader that hands out pre-cut chunks, then EOF.
    struct Chunks(VecDeque<Vec<u8>>);

    impl Chunks {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self(chunks.into())
        }
    }

    impl TransportRead for Chunks {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.0.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.0.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn decodes_frames_split_across_reads() {
        let mut wire = encode_frame(&Ping { seq: 1 }).unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(&Ping { seq: 2 }).unwrap());
        let chunks = wire.iter().map(|b| vec![*b]).collect();

        let mut reader = FrameReader::new(Chunks::new(chunks), DEFAULT_MAX_FRAME);
        assert_eq!(reader.next_frame::<Ping>().await.unwrap(), Some(Ping { seq: 1 }));
        assert_eq!(reader.next_frame::<Ping>().await.unwrap(), Some(Ping { seq: 2 }));
        assert_eq!(reader.next_frame::<Ping>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn leftover_bytes_survive_handover() {
        let mut wire = encode_frame(&Ping { seq: 7 }).unwrap().to_vec();
        wire.extend_from_slice(b"raw tail");

        let mut reader = FrameReader::new(Chunks::new(vec![wire]), DEFAULT_MAX_FRAME);
        assert_eq!(reader.next_frame::<Ping>().await.unwrap(), Some(Ping { seq: 7 }));
        let (_, leftover) = reader.into_parts();
        assert_eq!(&leftover[..], b"raw tail");
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_be_bytes());
        wire.extend_from_slice(b"{x}");
        wire.extend_from_slice(&encode_frame(&Ping { seq: 5 }).unwrap());

        let mut reader = FrameReader::new(Chunks::new(vec![wire]), DEFAULT_MAX_FRAME);
        assert_eq!(reader.next_frame::<Ping>().await.unwrap(), Some(Ping { seq: 5 }));
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let wire = 2048u32.to_be_bytes().to_vec();
        let mut reader = FrameReader::new(Chunks::new(vec![wire]), 1024);
        let err = reader.next_frame::<Ping>().await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 2048, max: 1024 }));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_truncated() {
        let wire = encode_frame(&Ping { seq: 1 }).unwrap();
        let cut = wire[..wire.len() - 1].to_vec();
        let mut reader = FrameReader::new(Chunks::new(vec![cut]), DEFAULT_MAX_FRAME);
        assert!(matches!(
            reader.next_frame::<Ping>().await.unwrap_err(),
            FrameError::Truncated { .. }
        ));
    }

    #[test]
    fn prefix_is_big_endian_length() {
        let frame = encode_frame(&Ping { seq: 1 }).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }
}
