//! Length-prefixed framing for the rendezvous TCP streams.
//!
//! ```text
//! [0..4] payload_length: u32 LE
//! [4]    kind: u8
//! [5..8] reserved (must be 0)
//! ```
//!
//! `Control` frames carry an rkyv-encoded [`BootstrapMessage`]; `Data`
//! frames carry raw allgather bytes whose size the receiver already knows.

use super::message::BootstrapMessage;
use crate::error::{CommError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_SIZE: usize = 8;

/// Largest control payload accepted from the wire.
const MAX_CONTROL_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Control = 0,
    Data = 1,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameKind::Control),
            1 => Some(FrameKind::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_length: u32,
    pub kind: FrameKind,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[4] = self.kind as u8;
        buf
    }

    /// Returns `None` if the kind byte is unknown.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        Some(Self {
            payload_length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: FrameKind::from_u8(buf[4])?,
        })
    }
}

fn header_for(kind: FrameKind, len: usize) -> Result<FrameHeader> {
    let payload_length = u32::try_from(len).map_err(|_| {
        CommError::EncodeFailed(format!(
            "frame payload of {len} bytes exceeds u32::MAX"
        ))
    })?;
    Ok(FrameHeader {
        payload_length,
        kind,
    })
}

async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrameHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    FrameHeader::decode(&buf)
        .ok_or_else(|| CommError::DecodeFailed(format!("unknown frame kind {}", buf[4])))
}

/// Encode a control message into `[header][rkyv payload]`.
pub fn encode_control(msg: &BootstrapMessage) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| CommError::EncodeFailed(e.to_string()))?;
    let header = header_for(FrameKind::Control, payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode the rkyv payload of a control frame.
pub fn decode_control(payload: &[u8]) -> Result<BootstrapMessage> {
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<BootstrapMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| CommError::DecodeFailed(e.to_string()))
}

pub async fn send_control<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &BootstrapMessage,
) -> Result<()> {
    let buf = encode_control(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn recv_control<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BootstrapMessage> {
    let header = read_header(reader).await?;
    if header.kind != FrameKind::Control {
        return Err(CommError::DecodeFailed(format!(
            "expected control frame, got {:?}",
            header.kind
        )));
    }
    let len = header.payload_length as usize;
    if len > MAX_CONTROL_PAYLOAD {
        return Err(CommError::DecodeFailed(format!(
            "control frame of {len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_control(&payload)
}

pub async fn send_data<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    let header = header_for(FrameKind::Data, data.len())?;
    writer.write_all(&header.encode()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive one data frame into `buf`, which must match the frame size
/// exactly.
pub async fn recv_data_into<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let header = read_header(reader).await?;
    if header.kind != FrameKind::Data {
        return Err(CommError::DecodeFailed(format!(
            "expected data frame, got {:?}",
            header.kind
        )));
    }
    let actual = header.payload_length as usize;
    if actual != buf.len() {
        return Err(CommError::RecvSizeMismatch {
            expected: buf.len(),
            actual,
        });
    }
    reader.read_exact(buf).await?;
    Ok(())
}
