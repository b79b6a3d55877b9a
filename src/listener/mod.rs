// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Listener transports. Each listener owns its endpoint, accepts
//! connections on its own task, and hands every accepted stream (together
//! with the handshake the transport requires) to its connection sink.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    listener::handshake::Handshake,
    manager::{forward::ForwardConnectionManager, proxy::ProxyConnectionManager},
};

pub mod cygwin;
pub mod handshake;
#[cfg(windows)]
pub mod hyperv;
#[cfg(windows)]
pub mod namedpipe;
#[cfg(windows)]
pub mod pageant;
pub mod tcp_nonce;
#[cfg(unix)]
pub mod unix;

/// Where a listener's accepted connections go: the framed proxy engine,
/// or the raw forwarding engine together with the target assuan socket
/// path.
#[derive(Clone)]
pub enum ConnectionSink {
    Proxy(Arc<ProxyConnectionManager>),
    Forward(Arc<ForwardConnectionManager>, Arc<str>),
}

impl ConnectionSink {
    /// Hands the stream over; on success the receiving engine owns it.
    pub fn delegate<S>(&self, stream: S, handshake: Handshake, peer: String)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {
        match self {
            ConnectionSink::Proxy(manager) => manager.delegate(stream, handshake, peer),
            ConnectionSink::Forward(manager, target) => {
                manager.delegate(stream, handshake, Arc::clone(target), peer);
            },
        }
    }
}

/// All listener transports behind one tag, so the orchestrator can hold a
/// uniform list.
pub enum BridgeListener {
    TcpNonce(tcp_nonce::TcpNonceListener),
    Cygwin(cygwin::CygwinListener),
    #[cfg(unix)]
    Unix(unix::UnixSocketListener),
    #[cfg(windows)]
    NamedPipe(namedpipe::NamedPipeListener),
    #[cfg(windows)]
    HyperV(hyperv::HyperVListener),
    #[cfg(windows)]
    Pageant(pageant::PageantListener),
}

impl BridgeListener {
    pub fn label(&self) -> &str {
        match self {
            BridgeListener::TcpNonce(l) => l.label(),
            BridgeListener::Cygwin(l) => l.label(),
            #[cfg(unix)]
            BridgeListener::Unix(l) => l.label(),
            #[cfg(windows)]
            BridgeListener::NamedPipe(l) => l.label(),
            #[cfg(windows)]
            BridgeListener::HyperV(l) => l.label(),
            #[cfg(windows)]
            BridgeListener::Pageant(l) => l.label(),
        }
    }

    /// Runs the accept loop until cancellation or a fatal transport error.
    pub async fn run(&self) -> Result<()> {
        match self {
            BridgeListener::TcpNonce(l) => l.run().await,
            BridgeListener::Cygwin(l) => l.run().await,
            #[cfg(unix)]
            BridgeListener::Unix(l) => l.run().await,
            #[cfg(windows)]
            BridgeListener::NamedPipe(l) => l.run().await,
            #[cfg(windows)]
            BridgeListener::HyperV(l) => l.run().await,
            #[cfg(windows)]
            BridgeListener::Pageant(l) => l.run().await,
        }
    }

    pub fn cancel(&self) {
        match self {
            BridgeListener::TcpNonce(l) => l.cancel(),
            BridgeListener::Cygwin(l) => l.cancel(),
            #[cfg(unix)]
            BridgeListener::Unix(l) => l.cancel(),
            #[cfg(windows)]
            BridgeListener::NamedPipe(l) => l.cancel(),
            #[cfg(windows)]
            BridgeListener::HyperV(l) => l.cancel(),
            #[cfg(windows)]
            BridgeListener::Pageant(l) => l.cancel(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            BridgeListener::TcpNonce(l) => l.is_cancelled(),
            BridgeListener::Cygwin(l) => l.is_cancelled(),
            #[cfg(unix)]
            BridgeListener::Unix(l) => l.is_cancelled(),
            #[cfg(windows)]
            BridgeListener::NamedPipe(l) => l.is_cancelled(),
            #[cfg(windows)]
            BridgeListener::HyperV(l) => l.is_cancelled(),
            #[cfg(windows)]
            BridgeListener::Pageant(l) => l.is_cancelled(),
        }
    }
}
