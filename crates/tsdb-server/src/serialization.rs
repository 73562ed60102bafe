//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte little-endian length, counting the prefix itself,
//! followed by that many bytes of UTF-8 JSON.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ServerError};

pub const LENGTH_FIELD_LENGTH: usize = 4;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub fn serialize<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let total = body.len() + LENGTH_FIELD_LENGTH;
    if total > MAX_FRAME_LEN {
        return Err(ServerError::Protocol(format!(
            "frame of {total} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Accumulates bytes from a stream and yields one decoded object per
/// complete frame. Bytes past the end of a frame are kept for the next one.
#[derive(Debug, Default)]
pub struct Deserializer {
    buf: BytesMut,
}

impl Deserializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `data`. Fails as soon as the pending frame header is invalid.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        self.check_header()
    }

    /// Whether a whole frame is buffered.
    pub fn ready(&self) -> bool {
        match self.declared_len() {
            Some(n) => (LENGTH_FIELD_LENGTH..=MAX_FRAME_LEN).contains(&n) && self.buf.len() >= n,
            None => false,
        }
    }

    /// Removes the next frame from the buffer and decodes it.
    pub fn deserialize<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.check_header()?;
        let n = match self.declared_len() {
            Some(n) if self.buf.len() >= n => n,
            _ => return Err(ServerError::Protocol("no complete frame buffered".into())),
        };
        let mut frame = self.buf.split_to(n);
        frame.advance(LENGTH_FIELD_LENGTH);
        serde_json::from_slice(&frame).map_err(|e| ServerError::Protocol(format!("invalid JSON: {e}")))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn declared_len(&self) -> Option<usize> {
        let header: [u8; LENGTH_FIELD_LENGTH] = self.buf.get(..LENGTH_FIELD_LENGTH)?.try_into().ok()?;
        Some(u32::from_le_bytes(header) as usize)
    }

    fn check_header(&self) -> Result<()> {
        match self.declared_len() {
            Some(n) if n < LENGTH_FIELD_LENGTH => Err(ServerError::Protocol(format!(
                "declared frame length {n} is shorter than its prefix"
            ))),
            Some(n) if n > MAX_FRAME_LEN => Err(ServerError::Protocol(format!(
                "declared frame length {n} exceeds the {MAX_FRAME_LEN} byte limit"
            ))),
            _ => Ok(()),
        }
    }
}

/// Reads until one frame is complete. `Ok(None)` means the peer closed the
/// stream first.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut de = Deserializer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if de.ready() {
            return de.deserialize().map(Some);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        de.append(&chunk[..n])?;
    }
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = serialize(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
