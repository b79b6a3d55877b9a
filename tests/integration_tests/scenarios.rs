// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;
use ssh_agent_bridge_rs::client::assuan::parse_rendezvous;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::common::{
    MockAgent, RunningBridge, client_section, config_with, connect_bridge,
    identities_payload, listener_section, round_trip, temp_path, wait_for_file,
};

#[tokio::test]
#[serial]
async fn test_list_with_one_upstream() -> Result<()> {
    let upstream =
        MockAgent::spawn(|_| identities_payload(&[(b"abc", b"xxyy")])).await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("up", &upstream.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    let reply = round_trip(&mut stream, &[0x0B]).await?;
    assert_eq!(
        reply,
        [
            0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x61, 0x62, 0x63,
            0x00, 0x00, 0x00, 0x04, 0x78, 0x78, 0x79, 0x79,
        ]
    );

    drop(stream);
    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_list_merges_two_upstreams_in_order() -> Result<()> {
    let first = MockAgent::spawn(|_| identities_payload(&[(b"A", b"a")])).await?;
    let second =
        MockAgent::spawn(|_| identities_payload(&[(b"B1", b"b1"), (b"B2", b"b2")]))
            .await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("first", &first.socket_path),
        client_section("second", &second.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    let reply = round_trip(&mut stream, &[0x0B]).await?;
    assert_eq!(
        reply,
        identities_payload(&[(b"A", b"a"), (b"B1", b"b1"), (b"B2", b"b2")]),
        "identities must keep configured upstream order"
    );

    drop(stream);
    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_sign_falls_back_to_second_upstream() -> Result<()> {
    let refusing = MockAgent::spawn(|_| vec![0x05]).await?;
    let signing = MockAgent::spawn(|request| {
        let mut sig = vec![0x0E];
        sig.extend_from_slice(&request.data);
        sig
    })
    .await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("refusing", &refusing.socket_path),
        client_section("signing", &signing.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    let reply = round_trip(&mut stream, &[0x0D, 0xAA, 0xBB]).await?;
    assert_eq!(reply, [0x0E, 0x0D, 0xAA, 0xBB], "winning reply passes unchanged");
    assert_eq!(refusing.seen_count(), 1);
    assert_eq!(signing.seen_count(), 1);

    drop(stream);
    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_sign_failure_everywhere_yields_single_byte() -> Result<()> {
    let a = MockAgent::spawn(|_| vec![0x05]).await?;
    let b = MockAgent::spawn(|_| vec![0x05]).await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("a", &a.socket_path),
        client_section("b", &b.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    let reply = round_trip(&mut stream, &[0x0D, 1, 2, 3]).await?;
    assert_eq!(reply, [0x05]);

    drop(stream);
    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_oversize_frame_closes_connection_before_upstream() -> Result<()> {
    let upstream = MockAgent::spawn(|_| vec![0x06]).await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("up", &upstream.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    // length = 262145, one over the cap
    stream.write_all(&[0x00, 0x04, 0x00, 0x01]).await?;
    let _ = stream.write_all(&[0u8; 64]).await;

    let mut sink = Vec::new();
    let read = stream.read_to_end(&mut sink).await;
    assert!(read.map(|n| n == 0).unwrap_or(true), "connection must be closed");
    assert_eq!(upstream.seen_count(), 0, "nothing may reach the upstream");

    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_wrong_nonce_is_dropped_before_framing() -> Result<()> {
    let upstream = MockAgent::spawn(|_| identities_payload(&[])).await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("up", &upstream.socket_path),
    ]))
    .await?;

    wait_for_file(&bridge_path).await?;
    let content = std::fs::read(&bridge_path)?;
    let (port, nonce) = parse_rendezvous(&content)?;

    // wrong nonce: flipped bytes, followed by a well-formed request
    let mut bad = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let flipped: Vec<u8> = nonce.iter().map(|b| !b).collect();
    bad.write_all(&flipped).await?;
    let _ = bad.write_all(&[0, 0, 0, 1, 0x0B]).await;
    let mut sink = Vec::new();
    let read = bad.read_to_end(&mut sink).await;
    assert!(read.map(|n| n == 0).unwrap_or(true), "mismatch must drop the peer");
    assert!(sink.is_empty());
    assert_eq!(upstream.seen_count(), 0);

    // the right nonce still gets through on a fresh connection
    let mut good = connect_bridge(&bridge_path).await?;
    let reply = round_trip(&mut good, &[0x0B]).await?;
    assert_eq!(reply, identities_payload(&[]));
    assert_eq!(upstream.seen_count(), 1);

    drop(good);
    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_pipelined_requests_reply_in_order() -> Result<()> {
    let upstream = MockAgent::spawn(|request| {
        // echo the sequence byte back inside a sign response
        vec![0x0E, request.data[1]]
    })
    .await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("up", &upstream.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    for seq in 0..6u8 {
        stream.write_all(&[0, 0, 0, 2, 0x0D, seq]).await?;
    }
    for seq in 0..6u8 {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        assert_eq!(u32::from_be_bytes(header), 2);
        let mut payload = [0u8; 2];
        stream.read_exact(&mut payload).await?;
        assert_eq!(payload, [0x0E, seq], "reply order must match request order");
    }

    drop(stream);
    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_remove_all_is_broadcast() -> Result<()> {
    let a = MockAgent::spawn(|_| vec![0x05]).await?;
    let b = MockAgent::spawn(|_| vec![0x06]).await?;

    let bridge_path = temp_path("bridge");
    let bridge = RunningBridge::start(config_with(vec![
        listener_section("wsl", &bridge_path),
        client_section("a", &a.socket_path),
        client_section("b", &b.socket_path),
    ]))
    .await?;

    let mut stream = connect_bridge(&bridge_path).await?;
    let reply = round_trip(&mut stream, &[0x13]).await?;
    assert_eq!(reply, [0x06], "caller always sees SUCCESS");
    assert_eq!(a.seen_count(), 1);
    assert_eq!(b.seen_count(), 1);

    drop(stream);
    bridge.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_unix_listener_forwards_raw_bytes() -> Result<()> {
    use ssh_agent_bridge_rs::cfg::enums::{Role, TransportType};

    use super::common::MockEchoTarget;

    let target = MockEchoTarget::spawn().await?;
    let upstream = MockAgent::spawn(|_| vec![0x06]).await?;

    let unix_path = temp_path("forward-sock");
    let mut forward = listener_section("gpg", &unix_path);
    forward.transport = TransportType::Unix;
    forward.role = Role::Listener;
    forward.forward_socket_path = Some(target.socket_path.display().to_string());

    let bridge = RunningBridge::start(config_with(vec![
        forward,
        client_section("up", &upstream.socket_path),
    ]))
    .await?;

    // wait until the unix socket is bound
    let mut stream = None;
    for _ in 0..200 {
        match tokio::net::UnixStream::connect(&unix_path).await {
            Ok(s) => {
                stream = Some(s);
                break;
            },
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
        }
    }
    let mut stream = stream.expect("unix socket never came up");

    // raw bytes, not agent frames, must survive the trip unchanged
    stream.write_all(b"OPTION hello\n").await?;
    let mut echoed = vec![0u8; b"OPTION hello\n".len()];
    stream.read_exact(&mut echoed).await?;
    assert_eq!(echoed, b"OPTION hello\n");

    // half-close: our EOF drains through and the far side closes too
    stream.shutdown().await?;
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    bridge.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_initialize_rejects_bad_listen_address() {
    let upstream_path = temp_path("unused");
    std::fs::write(&upstream_path, b"1\n0123456789abcdef").expect("rendezvous stub");

    let bridge_path = temp_path("bridge");
    let mut listener = listener_section("bad", &bridge_path);
    listener.listen_address = Some("not-an-address".to_string());

    let cfg = config_with(vec![
        listener,
        client_section("up", &upstream_path),
    ]);
    assert!(ssh_agent_bridge_rs::app::Application::initialize(&cfg).is_err());
    let _ = std::fs::remove_file(&upstream_path);
}
