//! Frame codec for the isolated-worker channel.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind byte) + sizeof(payload), NOT including the 4-byte prefix.
//!
//! Conversation (parent on the left, worker process on the right):
//! ```text
//! HANDSHAKE ->            <- READY | ERROR
//! PROCESS   ->            <- OUTCOME        (repeated, one at a time)
//! SHUTDOWN  ->            (worker runs on_teardown and exits 0)
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::envelope::Envelope;
use crate::host::PipelineOutcome;
use crate::types::{Error, ItemConfig, Result};

/// Bumped on any incompatible frame change.
pub const PROTOCOL_VERSION: u32 = 1;

pub const FRAME_HANDSHAKE: u8 = 0x01;
pub const FRAME_READY: u8 = 0x02;
pub const FRAME_PROCESS: u8 = 0x03;
pub const FRAME_OUTCOME: u8 = 0x04;
pub const FRAME_SHUTDOWN: u8 = 0x05;
pub const FRAME_ERROR: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol: u32,
    pub item: ItemConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub pid: u32,
    pub host_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub seq: u64,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub seq: u64,
    pub outcome: PipelineOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for WorkerError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake(Handshake),
    Ready(Ready),
    Process(ProcessRequest),
    Outcome(ProcessOutcome),
    Shutdown,
    Error(WorkerError),
}

impl Frame {
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Handshake(_) => FRAME_HANDSHAKE,
            Frame::Ready(_) => FRAME_READY,
            Frame::Process(_) => FRAME_PROCESS,
            Frame::Outcome(_) => FRAME_OUTCOME,
            Frame::Shutdown => FRAME_SHUTDOWN,
            Frame::Error(_) => FRAME_ERROR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "handshake",
            Frame::Ready(_) => "ready",
            Frame::Process(_) => "process",
            Frame::Outcome(_) => "outcome",
            Frame::Shutdown => "shutdown",
            Frame::Error(_) => "error",
        }
    }

    /// Payload bytes (without length and kind).
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Frame::Handshake(h) => rmp_serde::to_vec_named(h)?,
            Frame::Ready(r) => rmp_serde::to_vec_named(r)?,
            Frame::Process(p) => rmp_serde::to_vec_named(p)?,
            Frame::Outcome(o) => rmp_serde::to_vec_named(o)?,
            Frame::Shutdown => Vec::new(),
            Frame::Error(e) => rmp_serde::to_vec_named(e)?,
        };
        Ok(bytes)
    }

    pub fn decode(kind: u8, payload: &[u8]) -> Result<Self> {
        let frame = match kind {
            FRAME_HANDSHAKE => Frame::Handshake(rmp_serde::from_slice(payload)?),
            FRAME_READY => Frame::Ready(rmp_serde::from_slice(payload)?),
            FRAME_PROCESS => Frame::Process(rmp_serde::from_slice(payload)?),
            FRAME_OUTCOME => Frame::Outcome(rmp_serde::from_slice(payload)?),
            FRAME_SHUTDOWN => Frame::Shutdown,
            FRAME_ERROR => Frame::Error(rmp_serde::from_slice(payload)?),
            other => return Err(Error::codec(format!("unknown frame kind 0x{:02X}", other))),
        };
        Ok(frame)
    }
}

/// Read one raw frame from the stream.
///
/// Returns `(kind, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted frame size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too short: missing kind byte",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;
    let payload = frame_data.split_off(1);
    Ok(Some((frame_data[0], payload)))
}

/// Write one raw frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit a frame", payload.len()),
        )
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write a typed frame.
pub async fn send_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let payload = frame.encode_payload()?;
    write_frame(writer, frame.kind(), &payload).await?;
    Ok(())
}

/// Read and decode a typed frame. `None` on clean EOF.
pub async fn recv_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Frame>> {
    match read_frame(reader, max_frame_bytes).await? {
        Some((kind, payload)) => Frame::decode(kind, &payload).map(Some),
        None => Ok(None),
    }
}
