// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The orchestrator: builds the two connection engines, the dispatcher,
//! and every configured listener and client, wires them together, and owns
//! the start/stop order.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cfg::{
        config::{Config, Section},
        enums::{Role, TransportType},
    },
    client::{AgentClient, assuan::AssuanSocketClient},
    dispatch::MessageDispatcher,
    listener::{BridgeListener, ConnectionSink, cygwin::CygwinListener,
        tcp_nonce::TcpNonceListener},
    manager::{forward::ForwardConnectionManager, proxy::ProxyConnectionManager},
    utils,
};

pub struct Application {
    listeners: Vec<Arc<BridgeListener>>,
    dispatcher: Arc<MessageDispatcher>,
    proxy: Arc<ProxyConnectionManager>,
    forward: Arc<ForwardConnectionManager>,
    cancel: CancellationToken,
}

impl Application {
    /// Builds the full component graph from a validated configuration.
    pub fn initialize(cfg: &Config) -> Result<Self> {
        cfg.validate()?;

        let dispatcher = MessageDispatcher::new();
        let proxy = ProxyConnectionManager::new(dispatcher.handle());
        let forward = ForwardConnectionManager::new();

        let mut listeners = Vec::new();
        for section in &cfg.sections {
            match section.role {
                Role::Listener => {
                    debug!(
                        section = %section.name,
                        transport = %section.transport,
                        "setting up listener"
                    );
                    let listener =
                        build_listener(section, &proxy, &forward, &dispatcher)?;
                    listeners.push(Arc::new(listener));
                },
                Role::Client => {
                    debug!(
                        section = %section.name,
                        transport = %section.transport,
                        "setting up client"
                    );
                    dispatcher.add_client(build_client(section)?);
                },
            }
        }

        Ok(Self {
            listeners,
            dispatcher,
            proxy,
            forward,
            cancel: CancellationToken::new(),
        })
    }

    /// Runs until cancellation or the first listener failure. Teardown
    /// order: dispatcher, listeners, engines.
    pub async fn run(&self) -> Result<()> {
        self.dispatcher.start()?;

        let mut tasks = JoinSet::new();
        for listener in &self.listeners {
            let listener = Arc::clone(listener);
            tasks.spawn(async move {
                let label = listener.label().to_string();
                (label, listener.run().await)
            });
        }
        info!(listeners = self.listeners.len(), "bridge is running");

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((label, Ok(())))) => {
                        debug!(listener = %label, "listener exited");
                    },
                    Some(Ok((label, Err(e)))) => {
                        break Err(anyhow!("listener {label} failed: {e}"));
                    },
                    Some(Err(e)) => break Err(anyhow!("listener task died: {e}")),
                },
            }
        };

        self.dispatcher.stop().await;
        for listener in &self.listeners {
            listener.cancel();
        }
        while tasks.join_next().await.is_some() {}
        self.proxy.stop();
        self.forward.stop();

        outcome
    }

    /// Requests cooperative shutdown; `run` returns once teardown is done.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn client_count(&self) -> usize {
        self.dispatcher.client_count()
    }
}

/// Sink for a listener: raw forwarding when `forward-socket-path` is
/// present, the framed proxy engine otherwise.
fn listener_sink(
    section: &Section,
    proxy: &Arc<ProxyConnectionManager>,
    forward: &Arc<ForwardConnectionManager>,
) -> ConnectionSink {
    match &section.forward_socket_path {
        Some(target) => {
            debug!(section = %section.name, target = %target, "forwarding mode");
            ConnectionSink::Forward(
                Arc::clone(forward),
                Arc::from(utils::expand_env_vars(target)),
            )
        },
        None => ConnectionSink::Proxy(Arc::clone(proxy)),
    }
}

fn expanded_path(section: &Section) -> Result<String> {
    let path = section
        .path
        .as_deref()
        .ok_or_else(|| anyhow!("section {:?} requires a path", section.name))?;
    Ok(utils::expand_env_vars(path))
}

fn build_listener(
    section: &Section,
    proxy: &Arc<ProxyConnectionManager>,
    forward: &Arc<ForwardConnectionManager>,
    dispatcher: &Arc<MessageDispatcher>,
) -> Result<BridgeListener> {
    let sink = listener_sink(section, proxy, forward);
    match section.transport {
        TransportType::AssuanEmu => Ok(BridgeListener::TcpNonce(TcpNonceListener::new(
            section.name.clone(),
            expanded_path(section)?,
            section.listen_address.as_deref(),
            section.enable_permission_check,
            sink,
        )?)),
        TransportType::Cygwin => Ok(BridgeListener::Cygwin(CygwinListener::new(
            section.name.clone(),
            expanded_path(section)?,
            section.enable_permission_check,
            sink,
        )?)),
        #[cfg(unix)]
        TransportType::Unix => Ok(BridgeListener::Unix(
            crate::listener::unix::UnixSocketListener::new(
                section.name.clone(),
                expanded_path(section)?,
                section.enable_permission_check,
                sink,
            ),
        )),
        #[cfg(windows)]
        TransportType::NamedPipe => Ok(BridgeListener::NamedPipe(
            crate::listener::namedpipe::NamedPipeListener::new(
                section.name.clone(),
                expanded_path(section)?,
                sink,
            ),
        )),
        #[cfg(windows)]
        TransportType::HyperV => Ok(BridgeListener::HyperV(
            crate::listener::hyperv::HyperVListener::new(
                section.name.clone(),
                section.listen_address.clone().unwrap_or_default(),
                section.listen_port,
                section.listen_service_template.clone(),
                sink,
            ),
        )),
        #[cfg(windows)]
        TransportType::Pageant => Ok(BridgeListener::Pageant(
            crate::listener::pageant::PageantListener::new(
                section.name.clone(),
                dispatcher.handle(),
            ),
        )),
        other => {
            let _ = dispatcher;
            bail!(
                "listener type {other} is not supported on this platform (section {:?})",
                section.name
            )
        },
    }
}

fn build_client(section: &Section) -> Result<Arc<dyn AgentClient>> {
    match section.transport {
        TransportType::AssuanEmu => Ok(Arc::new(AssuanSocketClient::new(
            section.name.clone(),
            expanded_path(section)?,
        ))),
        #[cfg(unix)]
        TransportType::Unix => Ok(Arc::new(crate::client::unix::UnixSocketClient::new(
            section.name.clone(),
            expanded_path(section)?,
        ))),
        #[cfg(windows)]
        TransportType::NamedPipe => {
            Ok(Arc::new(crate::client::namedpipe::NamedPipeClient::new(
                section.name.clone(),
                expanded_path(section)?,
            )))
        },
        #[cfg(windows)]
        TransportType::Pageant => {
            if section.restrict_process.is_some() {
                tracing::warn!(
                    section = %section.name,
                    "restrict-process is accepted but not enforced"
                );
            }
            Ok(Arc::new(crate::client::pageant::PageantClient::new(
                section.name.clone(),
            )))
        },
        other => bail!(
            "client type {other} is not supported on this platform (section {:?})",
            section.name
        ),
    }
}
