// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{LogLevel, Role, TransportType};

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Process-wide settings.
    #[serde(default)]
    pub general: General,
    /// Listener and client declarations; order matters for clients, as it
    /// fixes the dispatcher fan-out order.
    pub sections: Vec<Section>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct General {
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Optional log file; stderr when unset.
    #[serde(default)]
    pub logfile: Option<String>,
}

/// One transport declaration. Which keys apply depends on `type` and
/// `role`; unknown combinations are rejected during validation.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Section {
    pub name: String,

    #[serde(rename = "type")]
    pub transport: TransportType,

    pub role: Role,

    /// Endpoint path: pipe name, socket file, or rendezvous file.
    /// `%VAR%` references are expanded against the environment.
    #[serde(default)]
    pub path: Option<String>,

    /// Switches a listener from proxied mode into raw forwarding toward
    /// the given assuan rendezvous file.
    #[serde(default, rename = "forward-socket-path")]
    pub forward_socket_path: Option<String>,

    #[serde(default, rename = "listen-address")]
    pub listen_address: Option<String>,

    /// Hyper-V service port.
    #[serde(default, rename = "listen-port")]
    pub listen_port: Option<u32>,

    /// Hyper-V service GUID template.
    #[serde(default, rename = "listen-service-template")]
    pub listen_service_template: Option<String>,

    /// Apply owner-only permissions to created endpoint files.
    #[serde(default = "default_true", rename = "enable-permission-check")]
    pub enable_permission_check: bool,

    /// Pageant client: only talk to windows owned by this process image.
    #[serde(default, rename = "restrict-process")]
    pub restrict_process: Option<String>,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path).with_context(|| {
            format!("cannot read config file {:?}", path.as_ref())
        })?;
        let cfg: Config =
            serde_yaml::from_str(&raw).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the section table invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.sections.is_empty(), "no sections configured");

        let mut client_count = 0usize;
        for section in &self.sections {
            match section.role {
                Role::Client => {
                    client_count += 1;
                    ensure!(
                        matches!(
                            section.transport,
                            TransportType::NamedPipe
                                | TransportType::Pageant
                                | TransportType::Unix
                                | TransportType::AssuanEmu
                        ),
                        "section {:?}: type {} does not support role client",
                        section.name,
                        section.transport
                    );
                    ensure!(
                        section.forward_socket_path.is_none(),
                        "section {:?}: forward-socket-path is a listener key",
                        section.name
                    );
                    match section.transport {
                        TransportType::Pageant => {},
                        _ => ensure!(
                            section.path.is_some(),
                            "section {:?}: client requires a path",
                            section.name
                        ),
                    }
                },
                Role::Listener => {
                    if section.forward_socket_path.is_some() {
                        ensure!(
                            section.transport.supports_forwarding(),
                            "section {:?}: forwarding is not supported for type {}",
                            section.name,
                            section.transport
                        );
                    }
                    match section.transport {
                        TransportType::Pageant | TransportType::HyperV => {},
                        _ => ensure!(
                            section.path.is_some(),
                            "section {:?}: listener requires a path",
                            section.name
                        ),
                    }
                },
            }
        }
        ensure!(client_count > 0, "no upstream client configured");

        Ok(())
    }

    /// Sections in declaration order with the given role.
    pub fn sections_with_role(&self, role: Role) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(move |s| s.role == role)
    }
}
