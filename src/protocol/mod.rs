//! Length-prefixed JSON framing (C1).
//!
//! A frame on the wire is `<u32 little-endian length><UTF-8 JSON body>`.
//! Deadlines are absolute (monotonic `Instant`s); a partial read or write
//! resumes against the remaining budget rather than restarting.

use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout_at;

use crate::error::ProtocolError;

pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Writes one frame, respecting an optional absolute deadline.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    value: &Value,
    deadline: Option<Instant>,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    let len = body.len() as u32;

    let write_all = async {
        stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        stream
            .write_all(&body)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    };

    match deadline {
        Some(d) => timeout_at(d.into(), write_all)
            .await
            .map_err(|_| ProtocolError::WriteTimeout)?,
        None => write_all.await,
    }
}

/// Reads one frame, respecting an optional absolute deadline.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    deadline: Option<Instant>,
) -> Result<Value, ProtocolError> {
    let read_all = async {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(e) => return Err(ProtocolError::Transport(e.to_string())),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_BYTES {
            return Err(ProtocolError::MalformedFrame);
        }

        let mut body = vec![0u8; len];
        match stream.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(e) => return Err(ProtocolError::Transport(e.to_string())),
        }

        serde_json::from_slice(&body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    };

    match deadline {
        Some(d) => timeout_at(d.into(), read_all)
            .await
            .map_err(|_| ProtocolError::ReadTimeout)?,
        None => read_all.await,
    }
}
