//! Newline-delimited framing: every JSON-RPC message is exactly one line.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Upper bound for a single frame, newline included.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one frame and appends its raw bytes (terminating `\n` included) to
/// `buf`. Returns `Ok(0)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, RpcError>
where
    R: AsyncBufRead + Unpin,
{
    let start = buf.len();
    let n = (&mut *reader)
        .take(MAX_FRAME_LEN as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(0);
    }
    if buf[start + n - 1] != b'\n' {
        if n > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge);
        }
        // peer went away halfway through a line
        return Err(RpcError::Closed);
    }
    Ok(n)
}

/// True for frames carrying nothing but whitespace.
pub fn is_blank(frame: &[u8]) -> bool {
    frame.iter().all(u8::is_ascii_whitespace)
}

/// Serializes `msg` as a single line and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
