// Length-prefixed framing over a byte stream: u32 big-endian length then
// body. The body cap is enforced before any allocation happens.
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Default cap on a frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Read one frame body. Returns `Ok(None)` on a clean close at a frame
/// boundary. The scratch buffer is reused to avoid per-frame allocations.
pub async fn read_frame<R>(
    reader: &mut R,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            // EOF inside the length prefix.
            return Err(Error::Truncated);
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame_bytes {
        return Err(Error::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    scratch.clear();
    scratch.resize(len, 0u8);
    reader.read_exact(&mut scratch[..]).await?;
    Ok(Some(scratch.split().freeze()))
}

/// Write one frame: length prefix then body.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge {
            len: body.len(),
            max: u32::MAX as usize,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
