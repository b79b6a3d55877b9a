// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pre-framing handshakes. Each listener that requires authentication
//! before agent traffic describes it as a tagged variant; the connection
//! managers interpret the variant on every accepted stream before the
//! first frame is read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BridgeError;

/// Secret length shared by the TCP-nonce and Cygwin rendezvous schemes.
pub const NONCE_LENGTH: usize = 16;
/// Length of the Cygwin `(pid, uid, gid)` identity exchange.
pub const IDENT_LENGTH: usize = 12;

/// The identity record exchanged after the Cygwin nonce echo. Stored and
/// transmitted as three little-endian u32 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CygwinIdentity {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl CygwinIdentity {
    /// Identity the server presents; the values carry no meaning to the
    /// emulated clients beyond being present.
    pub fn server_default() -> Self {
        Self {
            pid: 1,
            uid: 1,
            gid: 1,
        }
    }

    pub fn to_bytes(self) -> [u8; IDENT_LENGTH] {
        let mut out = [0u8; IDENT_LENGTH];
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[4..8].copy_from_slice(&self.uid.to_le_bytes());
        out[8..12].copy_from_slice(&self.gid.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; IDENT_LENGTH]) -> Self {
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&raw[i..i + 4]);
            u32::from_le_bytes(buf)
        };
        Self {
            pid: word(0),
            uid: word(4),
            gid: word(8),
        }
    }
}

/// What must happen on a fresh connection before framed traffic begins.
#[derive(Debug, Clone)]
pub enum Handshake {
    /// Transport carries its own access control; start framing immediately.
    None,
    /// Read 16 bytes and compare against the rendezvous nonce.
    TcpNonce { nonce: [u8; NONCE_LENGTH] },
    /// Nonce check, nonce echo, then a mutual 12-byte identity exchange.
    Cygwin {
        nonce: [u8; NONCE_LENGTH],
        server_identity: CygwinIdentity,
    },
}

/// Runs the handshake to completion. Any mismatch, short read, or write
/// failure is terminal for the connection.
pub async fn run<S>(
    stream: &mut S,
    handshake: &Handshake,
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match handshake {
        Handshake::None => Ok(()),
        Handshake::TcpNonce { nonce } => {
            check_nonce(stream, nonce, cancel).await?;
            debug!("nonce verified");
            Ok(())
        },
        Handshake::Cygwin {
            nonce,
            server_identity,
        } => {
            check_nonce(stream, nonce, cancel).await?;
            debug!("good nonce, echoing");
            write_cancellable(stream, nonce, cancel).await?;

            let mut ident = [0u8; IDENT_LENGTH];
            read_cancellable(stream, &mut ident, cancel).await?;
            let client = CygwinIdentity::from_bytes(&ident);
            debug!(
                pid = client.pid,
                uid = client.uid,
                gid = client.gid,
                "cygwin client identity"
            );

            write_cancellable(stream, &server_identity.to_bytes(), cancel).await?;
            debug!("authentication finished");
            Ok(())
        },
    }
}

async fn check_nonce<S>(
    stream: &mut S,
    expected: &[u8; NONCE_LENGTH],
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: AsyncRead + Unpin,
{
    let mut presented = [0u8; NONCE_LENGTH];
    read_cancellable(stream, &mut presented, cancel).await?;
    if &presented != expected {
        return Err(BridgeError::Handshake("incorrect nonce".into()));
    }
    Ok(())
}

async fn read_cancellable<S>(
    stream: &mut S,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: AsyncRead + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        res = stream.read_exact(buf) => res
            .map(|_| ())
            .map_err(|e| BridgeError::Handshake(format!("short read: {e}"))),
    }
}

async fn write_cancellable<S>(
    stream: &mut S,
    buf: &[u8],
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        res = async {
            stream.write_all(buf).await?;
            stream.flush().await
        } => res.map_err(|e| BridgeError::Handshake(format!("short write: {e}"))),
    }
}
