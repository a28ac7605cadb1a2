// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! CBOR codec for peer connections.
//!
//! Wire format per message:
//!   [4 bytes big-endian length][CBOR: {v, body}]
//!
//! The one-byte version `v` travels inside the CBOR body; decoders reject
//! frames whose version they do not understand. Max message size: 8 MiB.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{Envelope, PROTOCOL_VERSION};
use crate::error::IpcError;

const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024; // 8 MiB

#[derive(Serialize)]
struct FrameRef<'a> {
    v: u8,
    body: &'a Envelope,
}

#[derive(Deserialize)]
struct FrameOwned {
    v: u8,
    body: Envelope,
}

/// Write one envelope to `io`.
pub async fn write_envelope<W>(io: &mut W, env: &Envelope) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = Vec::new();
    ciborium::into_writer(
        &FrameRef {
            v: PROTOCOL_VERSION,
            body: env,
        },
        &mut payload,
    )
    .map_err(|e| IpcError::Protocol(format!("envelope encode: {e}")))?;

    if payload.len() > MAX_FRAME_BYTES {
        return Err(IpcError::Protocol(format!(
            "outgoing {} frame of {} bytes exceeds the {} byte cap",
            env.kind(),
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }

    let len = payload.len() as u32;
    io.write_all(&len.to_be_bytes())
        .await
        .map_err(IpcError::from)?;
    io.write_all(&payload).await.map_err(IpcError::from)?;
    io.flush().await.map_err(IpcError::from)?;
    Ok(())
}

/// Read one envelope from `io`.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly at a frame
/// boundary. EOF inside a frame is a protocol error.
pub async fn read_envelope<R>(io: &mut R) -> Result<Option<Envelope>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];

    // Read the first length byte separately so a clean close is
    // distinguishable from a truncated frame.
    let mut first = [0u8; 1];
    match io.read(&mut first).await {
        Ok(0) => return Ok(None),
        Ok(_) => len_buf[0] = first[0],
        Err(e) => return Err(IpcError::Io(e.to_string())),
    }
    io.read_exact(&mut len_buf[1..]).await.map_err(truncated)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(IpcError::Protocol(format!(
            "incoming frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte cap"
        )));
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await.map_err(truncated)?;

    let frame: FrameOwned = ciborium::from_reader(payload.as_slice())
        .map_err(|e| IpcError::Protocol(format!("envelope decode: {e}")))?;
    if frame.v != PROTOCOL_VERSION {
        return Err(IpcError::Protocol(format!(
            "unsupported protocol version {}",
            frame.v
        )));
    }
    Ok(Some(frame.body))
}

fn truncated(e: std::io::Error) -> IpcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        IpcError::Protocol("connection closed mid-frame".into())
    } else {
        IpcError::Io(e.to_string())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
