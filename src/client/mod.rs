// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upstream agent clients. Each client performs one synchronous framed
//! round trip: deliver the request, receive exactly one reply, overwrite
//! the envelope in place. The dispatcher serializes calls per client, so
//! implementations only need to be safe against *other* clients running
//! concurrently.

use std::{fmt::Debug, pin::Pin, time::Duration};

use anyhow::{Result, anyhow};
use tokio::time::timeout;

use crate::proto::frame::SshMessage;

pub mod assuan;
#[cfg(windows)]
pub mod namedpipe;
#[cfg(windows)]
pub mod pageant;
#[cfg(unix)]
pub mod unix;

/// Default bound on a full upstream round trip.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A framed request/reply upstream.
pub trait AgentClient: Send + Sync + Debug {
    /// Short name used in logs.
    fn label(&self) -> &str;

    /// Delivers the framed request and overwrites `msg` with the framed
    /// reply. Errors mean the round trip did not complete; the envelope
    /// contents are then unspecified and the caller discards them.
    fn exchange<'a>(&'a self, msg: &'a mut SshMessage) -> ExchangeFuture<'a>;
}

/// Bounds an upstream I/O future with the transport timeout.
pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    io_timeout: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(io_timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!("{label} timed out")),
    }
}
