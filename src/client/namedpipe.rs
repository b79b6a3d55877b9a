// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upstream agent behind a Windows named pipe (OpenSSH for Windows style
//! `\\.\pipe\openssh-ssh-agent`). One pipe open per round trip.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::windows::named_pipe::ClientOptions, time::sleep};

use crate::{
    client::{AgentClient, EXCHANGE_TIMEOUT, ExchangeFuture, io_with_timeout},
    proto::frame::{SshMessage, read_frame, write_frame},
};

// ERROR_PIPE_BUSY
const PIPE_BUSY: i32 = 231;
const OPEN_RETRIES: u32 = 10;

#[derive(Debug)]
pub struct NamedPipeClient {
    label: String,
    pipe_path: String,
}

impl NamedPipeClient {
    pub fn new(label: impl Into<String>, pipe_path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pipe_path: pipe_path.into(),
        }
    }

    async fn round_trip(&self, msg: &mut SshMessage) -> Result<()> {
        let mut attempts = 0;
        let mut pipe = loop {
            match ClientOptions::new().open(&self.pipe_path) {
                Ok(pipe) => break pipe,
                Err(e) if e.raw_os_error() == Some(PIPE_BUSY) => {
                    attempts += 1;
                    if attempts > OPEN_RETRIES {
                        return Err(e).with_context(|| {
                            format!("pipe {} stayed busy", self.pipe_path)
                        });
                    }
                    sleep(Duration::from_millis(50)).await;
                },
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("cannot open pipe {}", self.pipe_path)
                    });
                },
            }
        };
        write_frame(&mut pipe, msg).await?;
        *msg = read_frame(&mut pipe).await?;
        Ok(())
    }
}

impl AgentClient for NamedPipeClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn exchange<'a>(&'a self, msg: &'a mut SshMessage) -> ExchangeFuture<'a> {
        Box::pin(async move {
            io_with_timeout("pipe exchange", EXCHANGE_TIMEOUT, self.round_trip(msg))
                .await
        })
    }
}
