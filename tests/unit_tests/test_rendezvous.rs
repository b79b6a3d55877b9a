// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use ssh_agent_bridge_rs::listener::{cygwin::socket_file_content, handshake::NONCE_LENGTH};
use ssh_agent_bridge_rs::client::assuan::parse_rendezvous;

fn nonce() -> [u8; NONCE_LENGTH] {
    let mut n = [0u8; NONCE_LENGTH];
    for (i, b) in n.iter_mut().enumerate() {
        *b = (i as u8) + 1;
    }
    n
}

#[test]
fn test_assuan_rendezvous_round_trip() -> Result<()> {
    let mut content = Vec::new();
    content.extend_from_slice(b"54321\n");
    content.extend_from_slice(&nonce());

    let (port, parsed) = parse_rendezvous(&content)?;
    assert_eq!(port, 54321);
    assert_eq!(parsed, nonce());
    Ok(())
}

#[test]
fn test_assuan_rendezvous_rejects_garbage() {
    // no newline at all
    assert!(parse_rendezvous(b"12345").is_err());
    // port is not a number
    let mut content = Vec::from(&b"abc\n"[..]);
    content.extend_from_slice(&nonce());
    assert!(parse_rendezvous(&content).is_err());
    // truncated nonce
    assert!(parse_rendezvous(b"1234\nshort").is_err());
}

#[test]
fn test_cygwin_socket_file_format() {
    // nonce bytes 01..10, grouped as little-endian u32 words
    let content = socket_file_content(40000, &nonce());
    assert_eq!(
        content,
        b"!<socket >40000 s 04030201-08070605-0C0B0A09-100F0E0D\0"
    );
}

#[test]
fn test_cygwin_socket_file_is_nul_terminated() {
    let content = socket_file_content(1, &nonce());
    assert_eq!(content.last(), Some(&0u8));
    assert!(content.starts_with(b"!<socket >1 s "));
}
