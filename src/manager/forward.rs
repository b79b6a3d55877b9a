// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The raw forwarding engine. After the listener handshake it opens the
//! paired upstream (always a TCP-nonce assuan socket) and pumps bytes in
//! both directions without interpreting them. Each direction writes
//! everything it read before reading again, and an EOF on one side
//! half-closes the other side's send half; the context completes once both
//! directions have drained.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    client::assuan,
    error::BridgeError,
    listener::handshake::{self, Handshake as HandshakeKind},
    proto::frame::BUF_SIZE,
};

/// Bound on the listener-side handshake and on opening the peer socket.
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared engine for every listener running in forwarding mode.
pub struct ForwardConnectionManager {
    contexts: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl ForwardConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    /// Takes ownership of an accepted stream; `target` is the rendezvous
    /// file of the assuan socket this listener forwards to.
    pub fn delegate<S>(
        self: &Arc<Self>,
        stream: S,
        handshake: HandshakeKind,
        target: Arc<str>,
        peer: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        self.contexts.insert(id, cancel.clone());
        debug!(id, peer = %peer, "delegated connection to forward engine");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match forward_connection(stream, handshake, &target, &cancel).await {
                Ok(()) => debug!(id, "stopped forwarding"),
                Err(e) if e.is_cancelled() => debug!(id, "forwarding cancelled"),
                Err(e) => debug!(id, error = %e, "forwarding failed"),
            }
            manager.contexts.remove(&id);
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn active_connections(&self) -> usize {
        self.contexts.len()
    }
}

async fn forward_connection<S>(
    mut stream: S,
    handshake: HandshakeKind,
    target: &str,
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    timeout(SETUP_TIMEOUT, handshake::run(&mut stream, &handshake, cancel))
        .await
        .map_err(|_| BridgeError::Handshake("handshake timed out".into()))??;

    let peer = timeout(SETUP_TIMEOUT, assuan::connect(Path::new(target)))
        .await
        .map_err(|_| BridgeError::TransportOpen("target connect timed out".into()))?
        .map_err(|e| BridgeError::TransportOpen(e.to_string()))?;

    debug!(target, "started forwarding");
    pump(stream, peer, cancel).await
}

/// Full-duplex byte pump with graceful half-close in both directions.
pub async fn pump<A, B>(a: A, b: B, cancel: &CancellationToken) -> Result<(), BridgeError>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // a failing direction cancels its sibling so neither side lingers
    let guard = cancel.child_token();
    let forward = half_pump(a_read, b_write, &guard);
    let backward = half_pump(b_read, a_write, &guard);
    let (fwd, bwd) = tokio::join!(forward, backward);

    match (fwd, bwd) {
        (Ok(sent), Ok(received)) => {
            debug!(sent, received, "both directions drained");
            Ok(())
        },
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        // one direction usually fails as a side effect of the other
        (Err(first), Err(second)) => {
            Err(if first.is_cancelled() { second } else { first })
        },
    }
}

/// One direction: read up to a window, write all of it, repeat. EOF shuts
/// down the peer's send half and ends this direction.
async fn half_pump<R, W>(
    mut from: R,
    mut to: W,
    guard: &CancellationToken,
) -> Result<u64, BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUF_SIZE];
    let mut total: u64 = 0;

    let result = loop {
        let read = tokio::select! {
            _ = guard.cancelled() => break Err(BridgeError::Cancelled),
            r = from.read(&mut buf) => r,
        };
        match read {
            Ok(0) => {
                let _ = to.shutdown().await;
                break Ok(total);
            },
            Ok(n) => {
                if let Err(e) = to.write_all(&buf[..n]).await {
                    break Err(e.into());
                }
                total += n as u64;
            },
            Err(e) => break Err(e.into()),
        }
    };

    if result.is_err() {
        guard.cancel();
    }
    result
}
