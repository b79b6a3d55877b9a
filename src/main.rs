// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use ssh_agent_bridge_rs::{
    app::Application,
    cfg::{
        cli::{config_path_from_args, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = resolve_config_path(&config_path_from_args())
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let _logger_guard = init_logger(&cfg.general)?;

    let app = Arc::new(Application::initialize(&cfg)?);

    // first Ctrl-C cancels cooperatively, the runtime exits once teardown ends
    let canceller = Arc::clone(&app);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            canceller.cancel();
        } else {
            warn!("cannot listen for interrupt signal");
        }
    });

    app.run().await
}
