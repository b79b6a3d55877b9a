// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The subset of SSH agent messages the dispatcher interprets. Everything
//! else travels through the bridge as opaque bytes.

use anyhow::{Result, bail};

use crate::proto::{
    frame::SshMessage,
    wire::{MessageReader, MessageWriter},
};

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;

pub const SSH2_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH2_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH2_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH2_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH2_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH2_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH2_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;

/// One public key held by an agent: key blob plus comment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Identity {
    pub blob: Vec<u8>,
    pub comment: Vec<u8>,
}

impl Identity {
    pub fn from_buffer(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            blob: reader.read_string()?,
            comment: reader.read_string()?,
        })
    }

    pub fn to_buffer(&self, writer: &mut MessageWriter<'_>) {
        writer.write_string(&self.blob);
        writer.write_string(&self.comment);
    }
}

/// `IDENTITIES_ANSWER = byte(12) || u32(n) || n × identity`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdentitiesAnswer {
    pub identities: Vec<Identity>,
}

impl IdentitiesAnswer {
    pub fn from_buffer(reader: &mut MessageReader<'_>) -> Result<Self> {
        let id = reader.read_byte()?;
        if id != SSH2_AGENT_IDENTITIES_ANSWER {
            bail!("unexpected opcode {id} for identities answer");
        }
        let count = reader.read_u32()?;
        let mut identities = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            identities.push(Identity::from_buffer(reader)?);
        }
        Ok(Self { identities })
    }

    pub fn to_buffer(&self, writer: &mut MessageWriter<'_>) {
        writer.write_byte(SSH2_AGENT_IDENTITIES_ANSWER);
        writer.write_u32(self.identities.len() as u32);
        for identity in &self.identities {
            identity.to_buffer(writer);
        }
    }

    /// Parses a full envelope as an identities answer.
    pub fn parse(msg: &SshMessage) -> Result<Self> {
        Self::from_buffer(&mut MessageReader::new(msg))
    }

    /// Replaces the envelope payload with this answer.
    pub fn emit(&self, msg: &mut SshMessage) {
        let mut writer = MessageWriter::init(msg);
        self.to_buffer(&mut writer);
    }
}

/// Replaces the envelope payload with a single-byte `SSH_AGENT_FAILURE`.
pub fn emit_failure(msg: &mut SshMessage) {
    MessageWriter::init(msg).write_byte(SSH_AGENT_FAILURE);
}

/// Replaces the envelope payload with a single-byte `SSH_AGENT_SUCCESS`.
pub fn emit_success(msg: &mut SshMessage) {
    MessageWriter::init(msg).write_byte(SSH_AGENT_SUCCESS);
}
