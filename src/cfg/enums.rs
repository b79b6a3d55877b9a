// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Transport kind of a configuration section.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    #[serde(rename = "namedpipe", alias = "NamedPipe", alias = "NAMEDPIPE")]
    NamedPipe,
    #[serde(rename = "pageant", alias = "Pageant", alias = "PAGEANT")]
    Pageant,
    #[serde(rename = "unix", alias = "Unix", alias = "UNIX")]
    Unix,
    #[serde(rename = "assuan_emu", alias = "AssuanEmu", alias = "ASSUAN_EMU")]
    AssuanEmu,
    #[serde(rename = "hyperv", alias = "HyperV", alias = "HYPERV")]
    HyperV,
    #[serde(rename = "cygwin", alias = "Cygwin", alias = "CYGWIN")]
    Cygwin,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportType::NamedPipe => "namedpipe",
            TransportType::Pageant => "pageant",
            TransportType::Unix => "unix",
            TransportType::AssuanEmu => "assuan_emu",
            TransportType::HyperV => "hyperv",
            TransportType::Cygwin => "cygwin",
        })
    }
}

impl TransportType {
    /// Transports that may run in raw-forwarding mode.
    pub fn supports_forwarding(self) -> bool {
        matches!(
            self,
            TransportType::Unix
                | TransportType::AssuanEmu
                | TransportType::HyperV
                | TransportType::Cygwin
        )
    }
}

/// Role of a configuration section.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "listener", alias = "Listener", alias = "LISTENER")]
    Listener,
    #[serde(rename = "client", alias = "Client", alias = "CLIENT")]
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Listener => "listener",
            Role::Client => "client",
        })
    }
}

/// Log verbosity accepted in the `general` section.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[serde(rename = "debug", alias = "Debug", alias = "DEBUG")]
    Debug,
    #[default]
    #[serde(rename = "info", alias = "Info", alias = "INFO")]
    Info,
    #[serde(rename = "warn", alias = "Warn", alias = "WARN")]
    Warn,
    #[serde(rename = "error", alias = "Error", alias = "ERROR")]
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}
