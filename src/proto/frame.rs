// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One SSH agent frame on the wire:
//!
//! ```text
//! u32_be length
//! length × bytes payload     # payload[0] is the opcode
//! ```
//!
//! The declared length is capped at [`MAX_MESSAGE`]; anything larger is a
//! framing violation and the connection carrying it is torn down before a
//! single body byte is read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

/// Length prefix size in bytes.
pub const HEADER_LEN: usize = 4;
/// Upper bound for a declared payload length.
pub const MAX_MESSAGE: usize = 256 * 1024;
/// Scratch window used by the connection engines for chunked I/O.
pub const BUF_SIZE: usize = 4096;

/// An SSH agent message envelope. The wire length always equals
/// `data.len()`; the first payload byte is the opcode.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SshMessage {
    pub data: Vec<u8>,
}

impl SshMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First payload byte, absent for an empty envelope.
    pub fn opcode(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Resets the envelope for reuse between frames.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// The 4-byte big-endian header matching the current payload.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        (self.data.len() as u32).to_be_bytes()
    }
}

/// Decodes a header and checks it against [`MAX_MESSAGE`].
pub fn decode_length(header: [u8; HEADER_LEN]) -> Result<usize, BridgeError> {
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE {
        return Err(BridgeError::Framing(format!("message too long: {length}")));
    }
    Ok(length)
}

/// Reads exactly one frame. Used by upstream clients; the proxy engine
/// drives its own chunked read path through a bounded scratch window.
pub async fn read_frame<S>(stream: &mut S) -> Result<SshMessage, BridgeError>
where S: AsyncRead + Unpin {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| BridgeError::Framing(format!("short header read: {e}")))?;

    let length = decode_length(header)?;

    let mut data = vec![0u8; length];
    stream
        .read_exact(&mut data)
        .await
        .map_err(|e| BridgeError::Framing(format!("short body read: {e}")))?;

    Ok(SshMessage::new(data))
}

/// Writes one frame: header then payload.
pub async fn write_frame<S>(stream: &mut S, msg: &SshMessage) -> Result<(), BridgeError>
where S: AsyncWrite + Unpin {
    if msg.len() > MAX_MESSAGE {
        return Err(BridgeError::Framing(format!(
            "refusing to send oversize message: {}",
            msg.len()
        )));
    }
    stream.write_all(&msg.header()).await?;
    stream.write_all(&msg.data).await?;
    stream.flush().await?;
    Ok(())
}
