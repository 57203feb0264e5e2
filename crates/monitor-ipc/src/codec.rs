//! Wire framing: `[4-byte length][UTF-8 JSON payload]`.
//!
//! The length prefix is big-endian (network byte order) on both the read and
//! write paths. Earlier implementations of this protocol disagreed on byte
//! order between their two halves; this codec fixes one convention for both.

use monitor_proto::{Frame, FrameValidationError};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's JSON payload. A declared length above this
/// is treated as a corrupt stream, not a large message.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("declared frame length {declared} exceeds limit {MAX_FRAME_LEN}")]
    FrameTooLarge { declared: u64 },
    #[error("frame payload is not valid JSON: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidFrame(#[from] FrameValidationError),
}

/// Encode and write one frame. Flushes so the peer sees it immediately.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            declared: payload.len() as u64,
        });
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, buffering until the full declared length is available.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. Any other
/// shortfall, an oversized length, unparsable JSON, or an invalid frame shape
/// is an error the channel treats as fatal.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let declared = u32::from_be_bytes(len_buf) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            declared: declared as u64,
        });
    }

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).await?;

    let value: Value = serde_json::from_slice(&payload)?;
    let frame = Frame::validate(&value)?;
    Ok(Some(frame))
}
