// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use ssh_agent_bridge_rs::proto::{
    agent::{Identity, IdentitiesAnswer},
    frame::SshMessage,
    wire::{MessageReader, MessageWriter},
};

use super::identities_payload;

#[test]
fn test_field_round_trip() -> Result<()> {
    let mut m = SshMessage::default();
    let mut writer = MessageWriter::init(&mut m);
    writer.write_byte(0x0D);
    writer.write_bool(true);
    writer.write_bool(false);
    writer.write_u32(0xDEAD_BEEF);
    writer.write_u64(0x0102_0304_0506_0708);
    writer.write_string(b"key blob");

    let mut reader = MessageReader::new(&m);
    assert_eq!(reader.read_byte()?, 0x0D);
    assert!(reader.read_bool()?);
    assert!(!reader.read_bool()?);
    assert_eq!(reader.read_u32()?, 0xDEAD_BEEF);
    assert_eq!(reader.read_u64()?, 0x0102_0304_0506_0708);
    assert_eq!(reader.read_string()?, b"key blob");
    assert_eq!(reader.remaining(), 0);
    Ok(())
}

#[test]
fn test_integers_are_big_endian() {
    let mut m = SshMessage::default();
    let mut writer = MessageWriter::init(&mut m);
    writer.write_u32(0x0102_0304);
    assert_eq!(m.data, [0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn test_truncated_string_consumes_nothing() -> Result<()> {
    let mut m = SshMessage::default();
    let mut writer = MessageWriter::init(&mut m);
    writer.write_u32(100); // string length with no bytes behind it

    let mut reader = MessageReader::new(&m);
    assert!(reader.read_string().is_err());
    // the length prefix must still be readable as a plain u32
    assert_eq!(reader.read_u32()?, 100);
    Ok(())
}

#[test]
fn test_reads_past_end_fail() {
    let m = SshMessage::new(vec![1, 2]);
    let mut reader = MessageReader::new(&m);
    assert!(reader.read_u32().is_err());
    assert!(reader.read_u64().is_err());
    assert_eq!(reader.read_byte().expect("first byte"), 1);
}

#[test]
fn test_identities_answer_wire_shape() -> Result<()> {
    let answer = IdentitiesAnswer {
        identities: vec![Identity {
            blob: b"abc".to_vec(),
            comment: b"xxyy".to_vec(),
        }],
    };
    let mut m = SshMessage::default();
    answer.emit(&mut m);

    // byte(12) || u32(1) || u32(3) "abc" || u32(4) "xxyy"
    assert_eq!(
        m.data,
        [
            0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x61, 0x62, 0x63,
            0x00, 0x00, 0x00, 0x04, 0x78, 0x78, 0x79, 0x79,
        ]
    );
    assert_eq!(m.len(), 20);

    let decoded = IdentitiesAnswer::parse(&m)?;
    assert_eq!(decoded, answer);
    Ok(())
}

#[test]
fn test_identities_answer_rejects_wrong_opcode() {
    let m = SshMessage::new(vec![0x0B, 0, 0, 0, 0]);
    assert!(IdentitiesAnswer::parse(&m).is_err());
}

#[test]
fn test_identities_answer_rejects_truncated_list() {
    // claims two identities, carries one
    let mut m = identities_payload(&[(b"blob", b"note")]);
    m.data[4] = 2;
    assert!(IdentitiesAnswer::parse(&m).is_err());
}
