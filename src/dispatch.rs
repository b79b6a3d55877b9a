// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The message dispatcher: a single FIFO worker that applies a per-opcode
//! fan-out/fan-in policy over the ordered list of upstream clients.
//!
//! Ownership of the envelope moves into the dispatcher together with the
//! posted request and comes back through the reply channel; a reply sent to
//! a connection that died in the meantime is silently dropped, so the
//! worker never has to care whether the originator is still alive.

use std::sync::{Arc, Mutex};

use anyhow::{Result, ensure};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    client::AgentClient,
    proto::{
        agent::{
            self, IdentitiesAnswer, SSH2_AGENT_IDENTITIES_ANSWER,
            SSH2_AGENT_SIGN_RESPONSE, SSH2_AGENTC_ADD_IDENTITY,
            SSH2_AGENTC_REMOVE_ALL_IDENTITIES, SSH2_AGENTC_REMOVE_IDENTITY,
            SSH2_AGENTC_REQUEST_IDENTITIES, SSH2_AGENTC_SIGN_REQUEST,
            SSH_AGENT_SUCCESS,
        },
        frame::SshMessage,
    },
};

/// Outcome of one dispatched request. `ok == false` means the originating
/// connection must be torn down without emitting a reply frame.
#[derive(Debug)]
pub struct Reply {
    pub msg: SshMessage,
    pub ok: bool,
}

/// One queue entry: the request envelope plus the channel that resumes the
/// originating connection.
#[derive(Debug)]
pub struct PendingRequest {
    pub msg: SshMessage,
    pub reply: oneshot::Sender<Reply>,
}

/// Cloneable posting side of the dispatcher FIFO.
pub type DispatchHandle = mpsc::UnboundedSender<PendingRequest>;

pub struct MessageDispatcher {
    tx: DispatchHandle,
    rx: Mutex<Option<mpsc::UnboundedReceiver<PendingRequest>>>,
    clients: Mutex<Vec<Arc<dyn AgentClient>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatcher {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            clients: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Posting handle given to the connection managers.
    pub fn handle(&self) -> DispatchHandle {
        self.tx.clone()
    }

    /// Registers an upstream; configuration order is preserved and decides
    /// the fan-out order of every policy below.
    pub fn add_client(&self, client: Arc<dyn AgentClient>) {
        self.clients
            .lock()
            .expect("dispatcher client list poisoned")
            .push(client);
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .expect("dispatcher client list poisoned")
            .len()
    }

    /// Spawns the worker. Fails when no upstream client was configured.
    pub fn start(&self) -> Result<()> {
        let clients = self
            .clients
            .lock()
            .expect("dispatcher client list poisoned")
            .clone();
        ensure!(!clients.is_empty(), "no upstream client configured");

        let rx = self
            .rx
            .lock()
            .expect("dispatcher receiver poisoned")
            .take();
        let Some(rx) = rx else {
            anyhow::bail!("dispatcher already started");
        };

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            worker_loop(rx, clients, cancel).await;
        });
        *self.worker.lock().expect("dispatcher worker slot poisoned") = Some(handle);
        Ok(())
    }

    /// Cancels the worker and fails whatever is still queued so that every
    /// waiting connection is released.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .worker
            .lock()
            .expect("dispatcher worker slot poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("dispatcher stopped");
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<PendingRequest>,
    clients: Vec<Arc<dyn AgentClient>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(mut entry) => {
                    let ok = process_request(&clients, &mut entry.msg).await;
                    let _ = entry.reply.send(Reply { msg: entry.msg, ok });
                },
                None => break,
            },
        }
    }

    // teardown: everything still queued is failed, not answered
    rx.close();
    while let Ok(entry) = rx.try_recv() {
        let _ = entry.reply.send(Reply {
            msg: entry.msg,
            ok: false,
        });
    }
}

/// Applies the per-opcode policy. Returns `false` only when the request is
/// malformed beyond recovery or the single-upstream path failed outright;
/// the connection is then dropped without a reply.
pub async fn process_request(
    clients: &[Arc<dyn AgentClient>],
    msg: &mut SshMessage,
) -> bool {
    let Some(opcode) = msg.opcode() else {
        return false;
    };

    match opcode {
        SSH2_AGENTC_ADD_IDENTITY => handle_add_identity(clients, msg).await,
        SSH2_AGENTC_REMOVE_IDENTITY => handle_remove_identity(clients, msg).await,
        SSH2_AGENTC_REMOVE_ALL_IDENTITIES => {
            handle_remove_all_identities(clients, msg).await
        },
        SSH2_AGENTC_REQUEST_IDENTITIES => handle_request_identities(clients, msg).await,
        SSH2_AGENTC_SIGN_REQUEST => handle_sign_request(clients, msg).await,
        other => {
            debug!(opcode = other, "unsupported request");
            agent::emit_failure(msg);
            true
        },
    }
}

/// Key material goes to the first configured upstream only.
async fn handle_add_identity(
    clients: &[Arc<dyn AgentClient>],
    msg: &mut SshMessage,
) -> bool {
    let Some(client) = clients.first() else {
        return false;
    };
    match client.exchange(msg).await {
        Ok(()) => true,
        Err(e) => {
            debug!(client = client.label(), error = %e, "add identity failed");
            false
        },
    }
}

/// Each upstream is tried in order with its own copy; the first SUCCESS
/// reply wins.
async fn handle_remove_identity(
    clients: &[Arc<dyn AgentClient>],
    msg: &mut SshMessage,
) -> bool {
    for client in clients {
        let mut attempt = msg.clone();
        match client.exchange(&mut attempt).await {
            Ok(()) if attempt.opcode() == Some(SSH_AGENT_SUCCESS) => {
                *msg = attempt;
                return true;
            },
            Ok(()) => {},
            Err(e) => {
                debug!(client = client.label(), error = %e, "remove attempt failed");
            },
        }
    }
    agent::emit_failure(msg);
    true
}

/// Best-effort broadcast; the caller always sees SUCCESS.
async fn handle_remove_all_identities(
    clients: &[Arc<dyn AgentClient>],
    msg: &mut SshMessage,
) -> bool {
    for client in clients {
        let mut attempt = msg.clone();
        if let Err(e) = client.exchange(&mut attempt).await {
            debug!(client = client.label(), error = %e, "remove all failed upstream");
        }
    }
    agent::emit_success(msg);
    true
}

/// Queries every upstream and merges the answers, preserving the
/// configured client order. Upstreams that fail or reply with something
/// other than an identities answer simply contribute nothing.
async fn handle_request_identities(
    clients: &[Arc<dyn AgentClient>],
    msg: &mut SshMessage,
) -> bool {
    let mut answer = IdentitiesAnswer::default();
    for client in clients {
        debug!(client = client.label(), "requesting identities");
        let mut attempt = msg.clone();
        match client.exchange(&mut attempt).await {
            Ok(()) if attempt.opcode() == Some(SSH2_AGENT_IDENTITIES_ANSWER) => {
                match IdentitiesAnswer::parse(&attempt) {
                    Ok(partial) => {
                        debug!(
                            client = client.label(),
                            count = partial.identities.len(),
                            "got identities"
                        );
                        answer.identities.extend(partial.identities);
                    },
                    Err(e) => {
                        debug!(client = client.label(), error = %e, "malformed identities answer");
                    },
                }
            },
            Ok(()) => {},
            Err(e) => {
                debug!(client = client.label(), error = %e, "identities request failed");
            },
        }
    }
    debug!(
        count = answer.identities.len(),
        "assembling merged identities answer"
    );
    answer.emit(msg);
    true
}

/// Each upstream is tried in order; the first SIGN_RESPONSE wins.
async fn handle_sign_request(
    clients: &[Arc<dyn AgentClient>],
    msg: &mut SshMessage,
) -> bool {
    for client in clients {
        debug!(client = client.label(), "trying signature");
        let mut attempt = msg.clone();
        match client.exchange(&mut attempt).await {
            Ok(()) if attempt.opcode() == Some(SSH2_AGENT_SIGN_RESPONSE) => {
                debug!(client = client.label(), "signature done");
                *msg = attempt;
                return true;
            },
            Ok(()) => {},
            Err(e) => {
                debug!(client = client.label(), error = %e, "sign attempt failed");
            },
        }
    }
    debug!("no upstream produced a signature");
    agent::emit_failure(msg);
    true
}
