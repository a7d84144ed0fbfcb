//! Length-prefixed frame codec.
//!
//! Wire format:
//!
//! ```text
//! +----------------------+------------------------+
//! | length: u32 (BE)     | payload: length bytes  |
//! +----------------------+------------------------+
//! ```
//!
//! A zero-length frame is the heartbeat: the client sends it as a probe and
//! an echoing peer sends it back as the acknowledgement. It never reaches the
//! data callback.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LinkError, Result};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload either side may put in one frame.
pub const MAX_FRAME_LEN: usize = 1024;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Zero-length probe or acknowledgement.
    Heartbeat,
    /// Application payload (never empty).
    Data(Bytes),
}

/// Encode a payload into a complete frame.
///
/// An empty payload encodes the heartbeat frame.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// The encoded heartbeat frame.
pub fn heartbeat() -> Bytes {
    Bytes::from_static(&[0, 0, 0, 0])
}

/// Encode `payload` and write it with a single `write_all`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one frame.
///
/// Short reads are accumulated until `length` bytes arrive. EOF before the
/// length prefix surfaces as an `UnexpectedEof` I/O error, EOF inside the
/// payload as [`LinkError::Truncated`]. An oversized length is rejected
/// before any payload byte is consumed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Ok(Frame::Heartbeat);
    }
    if len > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = BytesMut::with_capacity(len);
    while payload.len() < len {
        // `take` keeps read_buf from pulling bytes of the next frame.
        let n = (&mut *reader)
            .take((len - payload.len()) as u64)
            .read_buf(&mut payload)
            .await?;
        if n == 0 {
            return Err(LinkError::Truncated {
                expected: len,
                received: payload.len(),
            });
        }
    }

    Ok(Frame::Data(payload.freeze()))
}
