// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client side of the libassuan TCP-nonce emulation: a rendezvous file on
//! disk names a loopback port and a 16-byte secret; presenting the secret
//! as the first bytes on the stream authorizes the connection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::debug;

use crate::{
    client::{AgentClient, EXCHANGE_TIMEOUT, ExchangeFuture, io_with_timeout},
    listener::handshake::NONCE_LENGTH,
    proto::frame::{SshMessage, read_frame, write_frame},
};

/// Parses `"<ASCII decimal port>\n" + 16 raw nonce bytes`.
pub fn parse_rendezvous(content: &[u8]) -> Result<(u16, [u8; NONCE_LENGTH])> {
    let Some(newline) = content.iter().position(|&b| b == b'\n') else {
        bail!("rendezvous file has no port line");
    };
    let port_text =
        std::str::from_utf8(&content[..newline]).context("port line is not UTF-8")?;
    let port: u16 = port_text
        .trim()
        .parse()
        .with_context(|| format!("invalid port number {port_text:?}"))?;

    let rest = &content[newline + 1..];
    if rest.len() < NONCE_LENGTH {
        bail!("rendezvous file truncated: {} nonce bytes", rest.len());
    }
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce.copy_from_slice(&rest[..NONCE_LENGTH]);
    Ok((port, nonce))
}

/// Opens an authorized stream to the agent behind the given rendezvous
/// file. Also used by the forward engine to reach its target socket.
pub async fn connect(socket_path: &Path) -> Result<TcpStream> {
    let content = tokio::fs::read(socket_path)
        .await
        .with_context(|| format!("cannot read rendezvous file {socket_path:?}"))?;
    let (port, nonce) = parse_rendezvous(&content)?;

    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("cannot connect to 127.0.0.1:{port}"))?;
    stream.set_nodelay(true)?;
    stream
        .write_all(&nonce)
        .await
        .context("cannot send nonce")?;
    debug!(port, "connected to assuan emulation socket");
    Ok(stream)
}

/// Upstream agent reached through an assuan emulation socket.
#[derive(Debug)]
pub struct AssuanSocketClient {
    label: String,
    socket_path: PathBuf,
}

impl AssuanSocketClient {
    pub fn new(label: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            socket_path: socket_path.into(),
        }
    }

    async fn round_trip(&self, msg: &mut SshMessage) -> Result<()> {
        let mut stream = connect(&self.socket_path).await?;
        write_frame(&mut stream, msg).await?;
        *msg = read_frame(&mut stream).await?;
        Ok(())
    }
}

impl AgentClient for AssuanSocketClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn exchange<'a>(&'a self, msg: &'a mut SshMessage) -> ExchangeFuture<'a> {
        Box::pin(async move {
            io_with_timeout("assuan exchange", EXCHANGE_TIMEOUT, self.round_trip(msg))
                .await
        })
    }
}
