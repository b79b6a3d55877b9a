// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The proxy connection engine. Every accepted connection runs one
//! machine: `Handshake → Ready → ReadHeader → ReadBody → WaitReply →
//! WriteReply → Ready`, with any failure disposing the context. All I/O
//! goes through a bounded scratch window, and at most one request per
//! connection is ever in flight.

use std::{
    io::ErrorKind,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    dispatch::{DispatchHandle, PendingRequest, Reply},
    error::BridgeError,
    listener::handshake::{self, Handshake as HandshakeKind},
    manager::{StateMachine, Transition},
    proto::frame::{BUF_SIZE, HEADER_LEN, MAX_MESSAGE, SshMessage, decode_length},
};

/// Shared engine for every listener that speaks framed agent traffic.
pub struct ProxyConnectionManager {
    dispatch: DispatchHandle,
    contexts: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl ProxyConnectionManager {
    pub fn new(dispatch: DispatchHandle) -> Arc<Self> {
        Arc::new(Self {
            dispatch,
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    /// Takes ownership of an accepted stream and drives its machine on a
    /// fresh task. The handshake variant comes from the accepting
    /// listener.
    pub fn delegate<S>(self: &Arc<Self>, stream: S, handshake: HandshakeKind, peer: String)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        self.contexts.insert(id, cancel.clone());
        debug!(id, peer = %peer, "delegated connection to proxy engine");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ctx =
                ProxyCtx::new(stream, handshake, manager.dispatch.clone(), cancel, peer);
            match ctx.execute().await {
                Ok(()) => debug!(id, "connection finished"),
                Err(e) if e.is_cancelled() => debug!(id, "connection cancelled"),
                Err(e) => debug!(id, error = %e, "terminating connection"),
            }
            manager.contexts.remove(&id);
        });
    }

    /// Cancels every live context. New delegations after this point are
    /// born cancelled.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn active_connections(&self) -> usize {
        self.contexts.len()
    }
}

/// Per-connection record: stream, scratch window, reusable envelope, and
/// the byte counters the states share.
pub struct ProxyCtx<S> {
    stream: S,
    handshake: HandshakeKind,
    dispatch: DispatchHandle,
    cancel: CancellationToken,
    peer: String,

    scratch: Box<[u8; BUF_SIZE]>,
    msg: SshMessage,
    /// Bytes still missing for the current read or write.
    need: usize,
    /// Position inside the reply payload already queued for writing.
    data_offset: usize,
    pending: Option<oneshot::Receiver<Reply>>,

    state: Option<ProxyStates>,
}

impl<S> ProxyCtx<S>
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    pub fn new(
        stream: S,
        handshake: HandshakeKind,
        dispatch: DispatchHandle,
        cancel: CancellationToken,
        peer: String,
    ) -> Self {
        Self {
            stream,
            handshake,
            dispatch,
            cancel,
            peer,
            scratch: Box::new([0u8; BUF_SIZE]),
            msg: SshMessage::default(),
            need: 0,
            data_offset: 0,
            pending: None,
            state: Some(ProxyStates::Handshake(Handshake)),
        }
    }

    /// Drives the machine until the connection completes or fails.
    pub async fn execute(&mut self) -> Result<(), BridgeError> {
        loop {
            let state = self.state.take().ok_or_else(|| {
                BridgeError::Framing("proxy context state must be set".into())
            })?;
            trace!(peer = %self.peer, state = state.name(), "stepping");

            let transition = match &state {
                ProxyStates::Handshake(s) => s.step(self).await,
                ProxyStates::Ready(s) => s.step(self).await,
                ProxyStates::ReadHeader(s) => s.step(self).await,
                ProxyStates::ReadBody(s) => s.step(self).await,
                ProxyStates::WaitReply(s) => s.step(self).await,
                ProxyStates::WriteReply(s) => s.step(self).await,
            };

            match transition {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(r) => {
                    r?;
                    self.state = Some(state);
                },
                Transition::Done(r) => return r,
            }
        }
    }

    /// Hands the completed request to the dispatcher; ownership of the
    /// envelope travels with it and comes back through the reply channel.
    fn post_message(&mut self) -> Result<(), BridgeError> {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            msg: std::mem::take(&mut self.msg),
            reply: tx,
        };
        debug!(
            peer = %self.peer,
            length = request.msg.len(),
            opcode = request.msg.opcode(),
            "recv message"
        );
        self.dispatch
            .send(request)
            .map_err(|_| BridgeError::UpstreamFailed("dispatcher unavailable".into()))?;
        self.pending = Some(rx);
        Ok(())
    }
}

#[derive(Debug)]
pub struct Handshake;
#[derive(Debug)]
pub struct Ready;
#[derive(Debug)]
pub struct ReadHeader;
#[derive(Debug)]
pub struct ReadBody;
#[derive(Debug)]
pub struct WaitReply;
#[derive(Debug)]
pub struct WriteReply;

#[derive(Debug)]
pub enum ProxyStates {
    Handshake(Handshake),
    Ready(Ready),
    ReadHeader(ReadHeader),
    ReadBody(ReadBody),
    WaitReply(WaitReply),
    WriteReply(WriteReply),
}

impl ProxyStates {
    fn name(&self) -> &'static str {
        match self {
            ProxyStates::Handshake(_) => "Handshake",
            ProxyStates::Ready(_) => "Ready",
            ProxyStates::ReadHeader(_) => "ReadHeader",
            ProxyStates::ReadBody(_) => "ReadBody",
            ProxyStates::WaitReply(_) => "WaitReply",
            ProxyStates::WriteReply(_) => "WriteReply",
        }
    }
}

type ProxyStepOut = Transition<ProxyStates, Result<(), BridgeError>>;

impl<S> StateMachine<ProxyCtx<S>, ProxyStepOut> for Handshake
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ProxyStepOut> + Send + 'a>>
    where
        Self: 'a,
        ProxyCtx<S>: 'a,
        ProxyStepOut: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ProxyCtx<S>) -> Self::StepResult<'a> {
        Box::pin(async move {
            match handshake::run(&mut ctx.stream, &ctx.handshake, &ctx.cancel).await {
                Ok(()) => Transition::Next(ProxyStates::Ready(Ready), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl<S> StateMachine<ProxyCtx<S>, ProxyStepOut> for Ready
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ProxyStepOut> + Send + 'a>>
    where
        Self: 'a,
        ProxyCtx<S>: 'a,
        ProxyStepOut: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ProxyCtx<S>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Transition::Done(Err(BridgeError::Cancelled));
            }
            ctx.msg.clear();
            ctx.need = HEADER_LEN;
            Transition::Next(ProxyStates::ReadHeader(ReadHeader), Ok(()))
        })
    }
}

impl<S> StateMachine<ProxyCtx<S>, ProxyStepOut> for ReadHeader
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ProxyStepOut> + Send + 'a>>
    where
        Self: 'a,
        ProxyCtx<S>: 'a,
        ProxyStepOut: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ProxyCtx<S>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let mut header = [0u8; HEADER_LEN];
            let mut got = 0;
            while got < HEADER_LEN {
                let read = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return Transition::Done(Err(BridgeError::Cancelled));
                    },
                    r = ctx.stream.read(&mut header[got..]) => r,
                };
                match read {
                    // EOF at a frame boundary is a normal disconnect;
                    // mid-header it is a framing violation
                    Ok(0) if got == 0 => return Transition::Done(Ok(())),
                    Ok(0) => {
                        return Transition::Done(Err(BridgeError::Framing(
                            "connection closed inside frame header".into(),
                        )));
                    },
                    Ok(n) => got += n,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof && got == 0 => {
                        return Transition::Done(Ok(()));
                    },
                    Err(e) => return Transition::Done(Err(e.into())),
                }
            }

            match decode_length(header) {
                Ok(length) => {
                    ctx.need = length;
                    Transition::Next(ProxyStates::ReadBody(ReadBody), Ok(()))
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl<S> StateMachine<ProxyCtx<S>, ProxyStepOut> for ReadBody
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ProxyStepOut> + Send + 'a>>
    where
        Self: 'a,
        ProxyCtx<S>: 'a,
        ProxyStepOut: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ProxyCtx<S>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.need == 0 {
                return match ctx.post_message() {
                    Ok(()) => Transition::Next(ProxyStates::WaitReply(WaitReply), Ok(())),
                    Err(e) => Transition::Done(Err(e)),
                };
            }

            let want = ctx.need.min(BUF_SIZE);
            let read = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Transition::Done(Err(BridgeError::Cancelled));
                },
                r = ctx.stream.read(&mut ctx.scratch[..want]) => r,
            };
            match read {
                Ok(0) => Transition::Done(Err(BridgeError::Framing(
                    "connection closed inside frame body".into(),
                ))),
                Ok(n) => {
                    ctx.msg.data.extend_from_slice(&ctx.scratch[..n]);
                    ctx.need -= n;
                    if ctx.need > 0 {
                        Transition::Stay(Ok(()))
                    } else {
                        match ctx.post_message() {
                            Ok(()) => Transition::Next(
                                ProxyStates::WaitReply(WaitReply),
                                Ok(()),
                            ),
                            Err(e) => Transition::Done(Err(e)),
                        }
                    }
                },
                Err(e) => Transition::Done(Err(e.into())),
            }
        })
    }
}

impl<S> StateMachine<ProxyCtx<S>, ProxyStepOut> for WaitReply
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ProxyStepOut> + Send + 'a>>
    where
        Self: 'a,
        ProxyCtx<S>: 'a,
        ProxyStepOut: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ProxyCtx<S>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let Some(rx) = ctx.pending.take() else {
                return Transition::Done(Err(BridgeError::UpstreamFailed(
                    "no request in flight".into(),
                )));
            };

            let reply = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Transition::Done(Err(BridgeError::Cancelled));
                },
                r = rx => r,
            };

            match reply {
                Ok(Reply { msg, ok: true }) => {
                    if msg.len() > MAX_MESSAGE {
                        return Transition::Done(Err(BridgeError::Framing(format!(
                            "reply too long: {}",
                            msg.len()
                        ))));
                    }
                    debug!(
                        peer = %ctx.peer,
                        length = msg.len(),
                        opcode = msg.opcode(),
                        "send message"
                    );
                    ctx.msg = msg;
                    ctx.need = HEADER_LEN + ctx.msg.len();
                    ctx.data_offset = 0;
                    Transition::Next(ProxyStates::WriteReply(WriteReply), Ok(()))
                },
                Ok(Reply { ok: false, .. }) => Transition::Done(Err(
                    BridgeError::UpstreamFailed("request dispatch failed".into()),
                )),
                Err(_) => Transition::Done(Err(BridgeError::UpstreamFailed(
                    "dispatcher dropped the request".into(),
                ))),
            }
        })
    }
}

impl<S> StateMachine<ProxyCtx<S>, ProxyStepOut> for WriteReply
where S: AsyncRead + AsyncWrite + Unpin + Send
{
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ProxyStepOut> + Send + 'a>>
    where
        Self: 'a,
        ProxyCtx<S>: 'a,
        ProxyStepOut: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ProxyCtx<S>) -> Self::StepResult<'a> {
        Box::pin(async move {
            // assemble the next window: the first one carries the header
            let scratch = &mut *ctx.scratch;
            let msg = &ctx.msg;
            let chunk = if ctx.need == HEADER_LEN + msg.len() {
                scratch[..HEADER_LEN].copy_from_slice(&msg.header());
                let take = (BUF_SIZE - HEADER_LEN).min(msg.len());
                scratch[HEADER_LEN..HEADER_LEN + take]
                    .copy_from_slice(&msg.data[..take]);
                ctx.data_offset = take;
                HEADER_LEN + take
            } else {
                let take = BUF_SIZE.min(msg.len() - ctx.data_offset);
                scratch[..take].copy_from_slice(
                    &msg.data[ctx.data_offset..ctx.data_offset + take],
                );
                ctx.data_offset += take;
                take
            };

            let written = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Transition::Done(Err(BridgeError::Cancelled));
                },
                r = async {
                    ctx.stream.write_all(&ctx.scratch[..chunk]).await?;
                    ctx.stream.flush().await
                } => r,
            };
            if let Err(e) = written {
                return Transition::Done(Err(e.into()));
            }

            ctx.need -= chunk;
            if ctx.need > 0 {
                Transition::Stay(Ok(()))
            } else {
                Transition::Next(ProxyStates::Ready(Ready), Ok(()))
            }
        })
    }
}
