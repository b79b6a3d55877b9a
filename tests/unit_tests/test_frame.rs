// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use ssh_agent_bridge_rs::{
    error::BridgeError,
    proto::frame::{
        HEADER_LEN, MAX_MESSAGE, SshMessage, decode_length, read_frame, write_frame,
    },
};

use super::msg;

#[tokio::test]
async fn test_frame_round_trip() -> Result<()> {
    for payload in [
        Vec::new(),
        vec![0x0B],
        vec![0xAA; 1],
        vec![0x5A; 4096],
        vec![0x42; 70_000],
    ] {
        let (mut a, mut b) = tokio::io::duplex(MAX_MESSAGE + HEADER_LEN);
        let original = SshMessage::new(payload.clone());
        write_frame(&mut a, &original).await?;
        let decoded = read_frame(&mut b).await?;
        assert_eq!(decoded.len(), payload.len());
        assert_eq!(decoded.data, payload);
    }
    Ok(())
}

#[tokio::test]
async fn test_frame_at_max_size() -> Result<()> {
    let (mut a, mut b) = tokio::io::duplex(2 * MAX_MESSAGE);
    let original = SshMessage::new(vec![7u8; MAX_MESSAGE]);
    write_frame(&mut a, &original).await?;
    let decoded = read_frame(&mut b).await?;
    assert_eq!(decoded.len(), MAX_MESSAGE);
    Ok(())
}

#[tokio::test]
async fn test_oversize_header_rejected() {
    // length = MAX_MESSAGE + 1
    let header = ((MAX_MESSAGE + 1) as u32).to_be_bytes();
    let err = decode_length(header).expect_err("oversize must be rejected");
    assert!(matches!(err, BridgeError::Framing(_)));

    let (mut a, mut b) = tokio::io::duplex(64);
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let _ = a.write_all(&header).await;
        let _ = a.write_all(&[0u8; 16]).await;
    });
    let err = read_frame(&mut b).await.expect_err("oversize must be rejected");
    assert!(matches!(err, BridgeError::Framing(_)));
}

#[tokio::test]
async fn test_short_body_is_framing_error() {
    let (mut a, mut b) = tokio::io::duplex(64);
    {
        use tokio::io::AsyncWriteExt;
        // announce 10 bytes, deliver 3, then close
        a.write_all(&10u32.to_be_bytes()).await.expect("header");
        a.write_all(&[1, 2, 3]).await.expect("partial body");
        drop(a);
    }
    let err = read_frame(&mut b).await.expect_err("short body must fail");
    assert!(matches!(err, BridgeError::Framing(_)));
}

#[tokio::test]
async fn test_refuses_to_send_oversize() {
    let (mut a, _b) = tokio::io::duplex(64);
    let oversized = SshMessage::new(vec![0u8; MAX_MESSAGE + 1]);
    let err = write_frame(&mut a, &oversized)
        .await
        .expect_err("oversize send must fail");
    assert!(matches!(err, BridgeError::Framing(_)));
}

#[test]
fn test_header_matches_length() {
    let m = msg(&[1, 2, 3, 4, 5]);
    assert_eq!(m.header(), [0, 0, 0, 5]);
    assert_eq!(m.opcode(), Some(1));
    assert!(SshMessage::default().opcode().is_none());
}
