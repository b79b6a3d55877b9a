// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upstream agent behind a unix-domain socket (a real `ssh-agent`, or
//! another bridge instance). One connection per round trip, like the
//! named-pipe client on Windows.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::UnixStream;

use crate::{
    client::{AgentClient, EXCHANGE_TIMEOUT, ExchangeFuture, io_with_timeout},
    proto::frame::{SshMessage, read_frame, write_frame},
};

#[derive(Debug)]
pub struct UnixSocketClient {
    label: String,
    socket_path: PathBuf,
}

impl UnixSocketClient {
    pub fn new(label: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            socket_path: socket_path.into(),
        }
    }

    async fn round_trip(&self, msg: &mut SshMessage) -> Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("cannot connect to {:?}", self.socket_path))?;
        write_frame(&mut stream, msg).await?;
        *msg = read_frame(&mut stream).await?;
        Ok(())
    }
}

impl AgentClient for UnixSocketClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn exchange<'a>(&'a self, msg: &'a mut SshMessage) -> ExchangeFuture<'a> {
        Box::pin(async move {
            io_with_timeout("unix exchange", EXCHANGE_TIMEOUT, self.round_trip(msg))
                .await
        })
    }
}
