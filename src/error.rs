// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Error kinds visible inside the bridge core.
///
/// Per-connection errors (`Handshake`, `Framing`, `Io`) never propagate past
/// the owning connection: the context is disposed and the client sees a
/// closed stream. `UpstreamFailed` is per-attempt and is absorbed by the
/// dispatcher policy. `TransportOpen` is fatal to the listener that raised
/// it and makes startup fail fast.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot open transport endpoint: {0}")]
    TransportOpen(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("framing violation: {0}")]
    Framing(String),

    #[error("upstream exchange failed: {0}")]
    UpstreamFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether this error is the cooperative shutdown signal rather than a
    /// real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}
