// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use ssh_agent_bridge_rs::cfg::{
    config::Config,
    enums::{LogLevel, Role, TransportType},
};

fn parse(yaml: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(yaml)?;
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_full_config_parses() -> Result<()> {
    let cfg = parse(
        r#"
general:
  loglevel: debug
sections:
  - name: wsl
    type: assuan_emu
    role: listener
    path: /tmp/agent-ssh-socket
    listen-address: 127.0.0.1
  - name: gpg-forward
    type: cygwin
    role: listener
    path: /tmp/gpg-agent-socket
    forward-socket-path: /tmp/real-gpg-agent
  - name: upstream
    type: assuan_emu
    role: client
    path: /tmp/upstream-socket
"#,
    )?;

    assert_eq!(cfg.general.loglevel, LogLevel::Debug);
    assert_eq!(cfg.sections.len(), 3);
    assert_eq!(cfg.sections_with_role(Role::Listener).count(), 2);
    assert_eq!(cfg.sections_with_role(Role::Client).count(), 1);

    let wsl = &cfg.sections[0];
    assert_eq!(wsl.transport, TransportType::AssuanEmu);
    assert!(wsl.enable_permission_check, "permission check defaults on");
    assert_eq!(wsl.listen_address.as_deref(), Some("127.0.0.1"));

    let forward = &cfg.sections[1];
    assert_eq!(
        forward.forward_socket_path.as_deref(),
        Some("/tmp/real-gpg-agent")
    );
    Ok(())
}

#[test]
fn test_loglevel_defaults_to_info() -> Result<()> {
    let cfg = parse(
        r#"
sections:
  - name: up
    type: assuan_emu
    role: client
    path: /tmp/up
"#,
    )?;
    assert_eq!(cfg.general.loglevel, LogLevel::Info);
    Ok(())
}

#[test]
fn test_config_requires_a_client() {
    let err = parse(
        r#"
sections:
  - name: only-listener
    type: assuan_emu
    role: listener
    path: /tmp/sock
"#,
    )
    .expect_err("client-less config must be rejected");
    assert!(err.to_string().contains("client"));
}

#[test]
fn test_forwarding_rejected_for_namedpipe() {
    let err = parse(
        r#"
sections:
  - name: pipe
    type: namedpipe
    role: listener
    path: pipe-name
    forward-socket-path: /tmp/target
  - name: up
    type: assuan_emu
    role: client
    path: /tmp/up
"#,
    )
    .expect_err("namedpipe cannot forward");
    assert!(err.to_string().contains("forwarding"));
}

#[test]
fn test_listener_without_path_rejected() {
    let err = parse(
        r#"
sections:
  - name: nameless
    type: unix
    role: listener
  - name: up
    type: assuan_emu
    role: client
    path: /tmp/up
"#,
    )
    .expect_err("pathless listener must be rejected");
    assert!(err.to_string().contains("path"));
}

#[test]
fn test_unknown_type_rejected() {
    assert!(
        parse(
            r#"
sections:
  - name: odd
    type: carrier-pigeon
    role: listener
    path: /tmp/sock
"#,
        )
        .is_err()
    );
}
