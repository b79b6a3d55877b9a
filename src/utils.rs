// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::Path;

use anyhow::{Context, Result};
use rand::RngExt;
use tracing::warn;

use crate::listener::handshake::NONCE_LENGTH;

/// Generates the 16-byte rendezvous secret.
pub fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce);
    nonce
}

/// Expands `%NAME%` references against the process environment. Tokens
/// that do not name a set variable are left untouched.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) if !name.is_empty() => out.push_str(&value),
                    _ => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    },
                }
                rest = &after[end + 1..];
            },
            None => {
                out.push('%');
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

/// Applies owner-only access to a freshly created rendezvous or socket
/// file where the platform supports it.
pub fn restrict_to_owner(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("cannot restrict permissions on {path:?}"))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Deletes a leftover socket/rendezvous file from a previous run.
pub fn remove_stale_file(path: &Path) {
    if path.exists() {
        warn!(?path, "socket file exists, deleting");
        if let Err(e) = std::fs::remove_file(path) {
            warn!(?path, error = %e, "cannot delete stale file");
        }
    }
}
