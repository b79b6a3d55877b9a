// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Cygwin socket emulation listener. Like the assuan shim it is a
//! loopback TCP socket behind a rendezvous file, but the file is framed as
//! `!<socket ><port> s <nonce hex groups>\0` and the post-connect
//! handshake is a four-way exchange: nonce check, nonce echo, then a
//! mutual 12-byte `(pid, uid, gid)` identity swap.

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
        handshake::{CygwinIdentity, Handshake, NONCE_LENGTH},
    },
    utils,
};

pub struct CygwinListener {
    label: String,
    socket_path: PathBuf,
    listen_address: IpAddr,
    permission_check: bool,
    sink: ConnectionSink,
    cancel: CancellationToken,
}

impl CygwinListener {
    pub fn new(
        label: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        permission_check: bool,
        sink: ConnectionSink,
    ) -> Result<Self> {
        let socket_path = socket_path.into();
        info!(path = ?socket_path, "cygwin emulation endpoint");
        Ok(Self {
            label: label.into(),
            socket_path,
            // cygwin sockets only ever live on the loopback interface
            listen_address: "127.0.0.1".parse().context("loopback address")?,
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

        write_socket_file(&self.socket_path, port, &nonce, self.permission_check)?;
        info!(port, path = ?self.socket_path, "listening for cygwin emulation clients");

        let server_identity = CygwinIdentity::server_default();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted a socket");
                        let _ = stream.set_nodelay(true);
                        self.sink.delegate(
                            stream,
                            Handshake::Cygwin { nonce, server_identity },
                            addr.to_string(),
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

/// Renders the nonce the way Cygwin expects it in the socket file: four
/// u32 groups in little-endian order, uppercase hex, dash separated.
pub fn socket_file_content(port: u16, nonce: &[u8; NONCE_LENGTH]) -> Vec<u8> {
    let group = |i: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&nonce[i..i + 4]);
        u32::from_le_bytes(buf)
    };
    let mut content = format!(
        "!<socket >{port} s {:08X}-{:08X}-{:08X}-{:08X}",
        group(0),
        group(4),
        group(8),
        group(12)
    )
    .into_bytes();
    content.push(0);
    content
}

pub fn write_socket_file(
    path: &Path,
    port: u16,
    nonce: &[u8; NONCE_LENGTH],
    permission_check: bool,
) -> Result<()> {
    utils::remove_stale_file(path);
    std::fs::write(path, socket_file_content(port, nonce))
        .with_context(|| format!("cannot write socket file {path:?}"))?;
    if permission_check {
        utils::restrict_to_owner(path)?;
    }
    Ok(())
}
