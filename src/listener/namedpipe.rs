// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Windows named pipe listener (OpenSSH for Windows style endpoint). The
//! pipe namespace carries the access control, so there is no pre-framing
//! handshake.

use anyhow::Result;
use tokio::net::windows::named_pipe::ServerOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::BridgeError,
    listener::{ConnectionSink, handshake::Handshake},
};

pub struct NamedPipeListener {
    label: String,
    pipe_path: String,
    sink: ConnectionSink,
    cancel: CancellationToken,
}

impl NamedPipeListener {
    pub fn new(
        label: impl Into<String>,
        pipe_path: impl Into<String>,
        sink: ConnectionSink,
    ) -> Self {
        let pipe_path = pipe_path.into();
        info!(path = %pipe_path, "named pipe endpoint");
        Self {
            label: label.into(),
            pipe_path,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(&self) -> Result<()> {
        // hold the pipe name from the start so clients never observe a gap
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&self.pipe_path)
            .map_err(|e| {
                BridgeError::TransportOpen(format!(
                    "cannot create pipe {}: {e}",
                    self.pipe_path
                ))
            })?;
        info!(path = %self.pipe_path, "listening for named pipe clients");

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = server.connect() => r,
            };
            if let Err(e) = connected {
                warn!(error = %e, "pipe connect failed");
                continue;
            }

            // queue the next instance before handing the connected one off
            let next = ServerOptions::new().create(&self.pipe_path);
            match next {
                Ok(next) => {
                    let connected = std::mem::replace(&mut server, next);
                    debug!("accepted a pipe connection");
                    self.sink.delegate(
                        connected,
                        Handshake::None,
                        self.pipe_path.clone(),
                    );
                },
                Err(e) => {
                    warn!(error = %e, "cannot create next pipe instance");
                    break;
                },
            }
        }

        info!(listener = %self.label, "stopped gracefully");
        Ok(())
    }
}
