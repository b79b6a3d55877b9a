// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use ssh_agent_bridge_rs::{
    error::BridgeError,
    listener::handshake::{self, CygwinIdentity, Handshake, IDENT_LENGTH, NONCE_LENGTH},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn nonce(seed: u8) -> [u8; NONCE_LENGTH] {
    let mut n = [0u8; NONCE_LENGTH];
    for (i, b) in n.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
    n
}

#[tokio::test]
async fn test_none_handshake_is_immediate() -> Result<()> {
    let (mut server, _client) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    handshake::run(&mut server, &Handshake::None, &cancel).await?;
    Ok(())
}

#[tokio::test]
async fn test_tcp_nonce_accepts_matching_secret() -> Result<()> {
    let (mut server, mut client) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let n = nonce(0x40);

    let driver = tokio::spawn(async move {
        client.write_all(&nonce(0x40)).await.expect("send nonce");
        client
    });

    handshake::run(&mut server, &Handshake::TcpNonce { nonce: n }, &cancel).await?;
    driver.await?;
    Ok(())
}

#[tokio::test]
async fn test_tcp_nonce_rejects_wrong_secret() {
    let (mut server, mut client) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let n = nonce(0x40);

    tokio::spawn(async move {
        client.write_all(&nonce(0x41)).await.expect("send nonce");
        client
    });

    let err = handshake::run(&mut server, &Handshake::TcpNonce { nonce: n }, &cancel)
        .await
        .expect_err("wrong nonce must be rejected");
    assert!(matches!(err, BridgeError::Handshake(_)));
}

#[tokio::test]
async fn test_tcp_nonce_rejects_short_read() {
    let (mut server, mut client) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let n = nonce(0x40);

    tokio::spawn(async move {
        client.write_all(&[0u8; 7]).await.expect("partial nonce");
        drop(client);
    });

    let err = handshake::run(&mut server, &Handshake::TcpNonce { nonce: n }, &cancel)
        .await
        .expect_err("short nonce must be rejected");
    assert!(matches!(err, BridgeError::Handshake(_)));
}

#[tokio::test]
async fn test_cygwin_four_way_exchange() -> Result<()> {
    let (mut server, mut client) = tokio::io::duplex(256);
    let cancel = CancellationToken::new();
    let n = nonce(0x10);
    let hs = Handshake::Cygwin {
        nonce: n,
        server_identity: CygwinIdentity::server_default(),
    };

    let driver = tokio::spawn(async move {
        // 1. nonce
        client.write_all(&nonce(0x10)).await.expect("send nonce");
        // 2. echoed nonce back
        let mut echoed = [0u8; NONCE_LENGTH];
        client.read_exact(&mut echoed).await.expect("read echo");
        assert_eq!(echoed, nonce(0x10));
        // 3. our identity
        let ident = CygwinIdentity {
            pid: 4242,
            uid: 1000,
            gid: 1000,
        };
        client
            .write_all(&ident.to_bytes())
            .await
            .expect("send identity");
        // 4. server identity
        let mut raw = [0u8; IDENT_LENGTH];
        client.read_exact(&mut raw).await.expect("read identity");
        CygwinIdentity::from_bytes(&raw)
    });

    handshake::run(&mut server, &hs, &cancel).await?;
    let server_ident = driver.await?;
    assert_eq!(server_ident, CygwinIdentity::server_default());
    Ok(())
}

#[tokio::test]
async fn test_cygwin_rejects_wrong_nonce_before_identity() {
    let (mut server, mut client) = tokio::io::duplex(256);
    let cancel = CancellationToken::new();
    let hs = Handshake::Cygwin {
        nonce: nonce(0x10),
        server_identity: CygwinIdentity::server_default(),
    };

    tokio::spawn(async move {
        client.write_all(&nonce(0x77)).await.expect("send nonce");
        client
    });

    let err = handshake::run(&mut server, &hs, &cancel)
        .await
        .expect_err("wrong nonce must be rejected");
    assert!(matches!(err, BridgeError::Handshake(_)));
}

#[tokio::test]
async fn test_cancel_releases_pending_handshake() {
    let (mut server, _client) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = handshake::run(
        &mut server,
        &Handshake::TcpNonce { nonce: nonce(1) },
        &cancel,
    )
    .await
    .expect_err("cancelled handshake must not block");
    assert!(err.is_cancelled());
}

#[test]
fn test_identity_bytes_are_little_endian() {
    let ident = CygwinIdentity {
        pid: 0x0102_0304,
        uid: 5,
        gid: 6,
    };
    let raw = ident.to_bytes();
    assert_eq!(&raw[0..4], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(CygwinIdentity::from_bytes(&raw), ident);
}
