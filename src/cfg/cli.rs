// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default configuration file next to the working directory.
pub const DEFAULT_CONFIG: &str = "bridge.yaml";

/// Picks the config path from the command line, falling back to
/// [`DEFAULT_CONFIG`].
pub fn config_path_from_args() -> String {
    std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string())
}

/// Resolves a possibly-relative config path to a canonical absolute one.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
