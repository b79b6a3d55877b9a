// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The libassuan TCP-nonce emulation listener (also the WSL shim): a
//! loopback TCP socket on an ephemeral port, announced through a
//! rendezvous file holding the port number and a 16-byte secret. Clients
//! must present the secret before any framed traffic.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::BridgeError,
    listener::{
        ConnectionSink,
        handshake::{Handshake, NONCE_LENGTH},
    },
    utils,
};

pub struct TcpNonceListener {
    label: String,
    socket_path: PathBuf,
    listen_address: IpAddr,
    permission_check: bool,
    sink: ConnectionSink,
    cancel: CancellationToken,
}

impl TcpNonceListener {
    pub fn new(
        label: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        listen_address: Option<&str>,
        permission_check: bool,
        sink: ConnectionSink,
    ) -> Result<Self> {
        let listen_address = listen_address
            .unwrap_or("127.0.0.1")
            .parse()
            .context("invalid listen-address")?;
        let socket_path = socket_path.into();
        info!(path = ?socket_path, address = %listen_address, "assuan emulation endpoint");
        Ok(Self {
            label: label.into(),
            socket_path,
            listen_address,
            permission_check,
            sink,
            cancel: CancellationToken::new(),
        })
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
        let nonce = utils::generate_nonce();
        let listener = TcpListener::bind((self.listen_address, 0))
            .await
            .map_err(|e| {
                BridgeError::TransportOpen(format!(
                    "bind {} failed: {e}",
                    self.listen_address
                ))
            })?;
        let port = listener.local_addr()?.port();

        write_rendezvous_file(&self.socket_path, port, &nonce, self.permission_check)?;
        info!(port, path = ?self.socket_path, "listening for assuan emulation clients");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted a socket");
                        let _ = stream.set_nodelay(true);
                        self.sink.delegate(
                            stream,
                            Handshake::TcpNonce { nonce },
                            addr.to_string(),
                        );
                    },
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "cannot remove rendezvous file");
        }
        info!(listener = %self.label, "stopped gracefully");
        Ok(())
    }
}

/// Writes `"<port>\n" + nonce` and locks the file to the owner.
pub fn write_rendezvous_file(
    path: &Path,
    port: u16,
    nonce: &[u8; NONCE_LENGTH],
    permission_check: bool,
) -> Result<()> {
    utils::remove_stale_file(path);

    let mut content = Vec::with_capacity(8 + NONCE_LENGTH);
    content.extend_from_slice(port.to_string().as_bytes());
    content.push(b'\n');
    content.extend_from_slice(nonce);

    std::fs::write(path, &content)
        .with_context(|| format!("cannot write rendezvous file {path:?}"))?;
    if permission_check {
        utils::restrict_to_owner(path)?;
    }
    Ok(())
}
