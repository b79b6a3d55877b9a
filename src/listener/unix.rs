// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Plain unix-domain socket listener. The filesystem carries the access
//! control, so there is no pre-framing handshake.

use std::path::PathBuf;

use anyhow::Result;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::BridgeError,
    listener::{ConnectionSink, handshake::Handshake},
    utils,
};

pub struct UnixSocketListener {
    label: String,
    socket_path: PathBuf,
    permission_check: bool,
    sink: ConnectionSink,
    cancel: CancellationToken,
}

impl UnixSocketListener {
    pub fn new(
        label: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        permission_check: bool,
        sink: ConnectionSink,
    ) -> Self {
        let socket_path = socket_path.into();
        info!(path = ?socket_path, "unix socket endpoint");
        Self {
            label: label.into(),
            socket_path,
            permission_check,
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
        utils::remove_stale_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            BridgeError::TransportOpen(format!(
                "bind {:?} failed: {e}",
                self.socket_path
            ))
        })?;
        if self.permission_check {
            utils::restrict_to_owner(&self.socket_path)?;
        }
        info!(path = ?self.socket_path, "listening for unix socket clients");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("accepted a socket");
                        self.sink.delegate(
                            stream,
                            Handshake::None,
                            self.socket_path.display().to_string(),
                        );
                    },
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "cannot remove socket file");
        }
        info!(listener = %self.label, "stopped gracefully");
        Ok(())
    }
}
