//! Length-delimited BER frame reading. One frame is one complete LDAPMessage
//! TLV; reads are coalesced until the declared length is satisfied, so a
//! frame larger than any single read() still arrives whole.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single LDAP PDU. Anything larger is treated as malformed
/// rather than buffered without limit.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Every LDAPMessage is a universal SEQUENCE.
const SEQUENCE_TAG: u8 = 0x30;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Clean EOF at a message boundary.
    #[error("connection closed")]
    Closed,
    /// EOF in the middle of a frame.
    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    /// Invalid tag or length encoding.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental frame reader. Holds the reassembly buffer across calls, so
/// bytes of a following frame read together with the current one are kept.
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read exactly one BER frame from `stream`, returning its full bytes
    /// (tag + length + content). Progress is driven by the number of bytes
    /// still owed, never by the number of read calls.
    pub async fn read_frame<R>(&mut self, stream: &mut R) -> Result<Vec<u8>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(total) = self.frame_total_len()? {
                if self.buf.len() >= total {
                    let frame = self.buf[..total].to_vec();
                    self.buf.advance(total);
                    return Ok(frame);
                }
            }
            let n = stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(FrameError::Closed);
                }
                return Err(FrameError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }
    }

    /// Total frame length once the header is decodable; None while more
    /// header bytes are needed.
    fn frame_total_len(&self) -> Result<Option<usize>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        if self.buf[0] != SEQUENCE_TAG {
            return Err(FrameError::Malformed(format!(
                "expected SEQUENCE tag 0x30, got 0x{:02X}",
                self.buf[0]
            )));
        }
        let first = self.buf[1];
        let total = if (first & 0x80) == 0 {
            2 + first as usize
        } else {
            let length_bytes = (first & 0x7F) as usize;
            if length_bytes == 0 {
                return Err(FrameError::Malformed("indefinite length".to_string()));
            }
            if length_bytes > 4 {
                return Err(FrameError::Malformed(format!(
                    "length encoding of {} bytes",
                    length_bytes
                )));
            }
            if self.buf.len() < 2 + length_bytes {
                return Ok(None);
            }
            let mut length = 0usize;
            for i in 0..length_bytes {
                length = (length << 8) | self.buf[2 + i] as usize;
            }
            2 + length_bytes + length
        };
        if total > MAX_FRAME_LEN {
            return Err(FrameError::Malformed(format!(
                "frame of {} bytes exceeds limit",
                total
            )));
        }
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame_of(content_len: usize) -> Vec<u8> {
        let mut frame = vec![SEQUENCE_TAG];
        if content_len < 128 {
            frame.push(content_len as u8);
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            frame.push(0x80 | bytes.len() as u8);
            frame.extend_from_slice(&bytes);
        }
        frame.extend(std::iter::repeat(0x41u8).take(content_len));
        frame
    }

    #[tokio::test]
    async fn test_read_frame_short_form() {
        let frame = frame_of(5);
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&frame).await.unwrap();
        drop(server);
        let mut reader = FrameReader::new();
        let got = reader.read_frame(&mut client).await.unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_read_frame_across_many_short_reads() {
        // 64 KiB frame delivered in 1 KiB chunks must be reassembled whole.
        let frame = frame_of(64 * 1024);
        let expected = frame.clone();
        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(1024) {
                server.write_all(chunk).await.unwrap();
            }
        });
        let mut reader = FrameReader::new();
        let got = reader.read_frame(&mut client).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_read_two_frames_from_one_burst() {
        let a = frame_of(3);
        let b = frame_of(200);
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut burst = a.clone();
        burst.extend_from_slice(&b);
        server.write_all(&burst).await.unwrap();
        drop(server);
        let mut reader = FrameReader::new();
        assert_eq!(reader.read_frame(&mut client).await.unwrap(), a);
        assert_eq!(reader.read_frame(&mut client).await.unwrap(), b);
        assert!(matches!(
            reader.read_frame(&mut client).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_eof_at_boundary_is_closed() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.read_frame(&mut client).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_truncated() {
        let frame = frame_of(100);
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&frame[..10]).await.unwrap();
        drop(server);
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.read_frame(&mut client).await,
            Err(FrameError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_tag_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        drop(server);
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.read_frame(&mut client).await,
            Err(FrameError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_indefinite_length_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0x30, 0x80, 0x00, 0x00]).await.unwrap();
        drop(server);
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.read_frame(&mut client).await,
            Err(FrameError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Declares a 512 MiB frame.
        server
            .write_all(&[0x30, 0x84, 0x20, 0x00, 0x00, 0x00])
            .await
            .unwrap();
        drop(server);
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.read_frame(&mut client).await,
            Err(FrameError::Malformed(_))
        ));
    }
}
