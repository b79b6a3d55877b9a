// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hyper-V socket listener: an AF_HYPERV stream endpoint reachable from
//! guest partitions (WSL2 in particular). The service id is derived from
//! the configured port templated into the vsock service GUID. No
//! pre-framing handshake; the hypervisor scopes who can connect.

use std::{
    mem::size_of,
    os::windows::io::FromRawSocket,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use windows_sys::{
    Win32::Networking::WinSock::{
        AF_HYPERV, INVALID_SOCKET, SOCK_STREAM, SOCKET_ERROR, WSA_FLAG_OVERLAPPED,
        WSASocketW, accept, bind, closesocket, listen,
    },
    core::GUID,
};

use crate::{
    error::BridgeError,
    listener::{ConnectionSink, handshake::Handshake},
};

/// Default agent service port, used when the config does not name one.
pub const DEFAULT_PORT: u32 = 0x4441_7A9F;

const HV_GUID_WILDCARD: GUID = guid(0, 0, 0, [0, 0, 0, 0, 0, 0, 0, 0]);
const HV_GUID_CHILDREN: GUID = guid(
    0x90db_8b89,
    0x0d35,
    0x4f79,
    [0x8c, 0xe9, 0x49, 0xea, 0x0a, 0xc8, 0xb7, 0xcd],
);
const HV_GUID_LOOPBACK: GUID = guid(
    0xe0e1_6197,
    0xdd56,
    0x4a10,
    [0x91, 0x95, 0x5e, 0xe7, 0xa1, 0x55, 0xa8, 0x38],
);
const HV_GUID_VSOCK_TEMPLATE: GUID = guid(
    0,
    0xfacb,
    0x11e6,
    [0xbd, 0x58, 0x64, 0x00, 0x6a, 0x79, 0x86, 0xd3],
);

const fn guid(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> GUID {
    GUID {
        data1,
        data2,
        data3,
        data4,
    }
}

#[repr(C)]
struct SockaddrHv {
    family: u16,
    reserved: u16,
    vm_id: GUID,
    service_id: GUID,
}

/// Parses `8-4-4-4-12` hex GUID text, with or without braces.
pub fn parse_guid(text: &str) -> Result<GUID> {
    let trimmed = text.trim().trim_start_matches('{').trim_end_matches('}');
    let parts: Vec<&str> = trimmed.split('-').collect();
    if parts.len() != 5
        || parts[0].len() != 8
        || parts[1].len() != 4
        || parts[2].len() != 4
        || parts[3].len() != 4
        || parts[4].len() != 12
    {
        bail!("invalid GUID {text:?}");
    }
    let data1 = u32::from_str_radix(parts[0], 16)?;
    let data2 = u16::from_str_radix(parts[1], 16)?;
    let data3 = u16::from_str_radix(parts[2], 16)?;
    let tail = hex::decode(format!("{}{}", parts[3], parts[4]))
        .with_context(|| format!("invalid GUID tail in {text:?}"))?;
    let mut data4 = [0u8; 8];
    data4.copy_from_slice(&tail);
    Ok(guid(data1, data2, data3, data4))
}

/// Resolves the configured partition alias or GUID into a VmId.
fn resolve_vm_id(text: &str) -> Result<GUID> {
    match text {
        "" | "0" | "wildcard" => Ok(HV_GUID_WILDCARD),
        "children" => Ok(HV_GUID_CHILDREN),
        "loopback" => Ok(HV_GUID_LOOPBACK),
        other => parse_guid(other),
    }
}

pub struct HyperVListener {
    label: String,
    listen_guid: String,
    port: u32,
    service_template: Option<String>,
    sink: ConnectionSink,
    cancel: CancellationToken,
    // raw listening socket, kept so Cancel can close it out from under accept
    raw_socket: AtomicUsize,
}

impl HyperVListener {
    pub fn new(
        label: impl Into<String>,
        listen_guid: impl Into<String>,
        port: Option<u32>,
        service_template: Option<String>,
        sink: ConnectionSink,
    ) -> Self {
        Self {
            label: label.into(),
            listen_guid: listen_guid.into(),
            port: port.unwrap_or(DEFAULT_PORT),
            service_template,
            sink,
            cancel: CancellationToken::new(),
            raw_socket: AtomicUsize::new(INVALID_SOCKET),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        let raw = self.raw_socket.swap(INVALID_SOCKET, Ordering::SeqCst);
        if raw != INVALID_SOCKET {
            unsafe {
                closesocket(raw);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(&self) -> Result<()> {
        let vm_id = resolve_vm_id(&self.listen_guid)?;
        let mut service_id = match &self.service_template {
            Some(template) => parse_guid(template)?,
            None => HV_GUID_VSOCK_TEMPLATE,
        };
        // vsock-style addressing: the port rides in the first GUID field
        service_id.data1 = self.port;

        let listen_socket = unsafe {
            WSASocketW(
                AF_HYPERV as i32,
                SOCK_STREAM,
                1, // HV_PROTOCOL_RAW
                std::ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        };
        if listen_socket == INVALID_SOCKET {
            return Err(BridgeError::TransportOpen(
                "cannot create hyper-v socket".into(),
            )
            .into());
        }
        self.raw_socket.store(listen_socket, Ordering::SeqCst);

        let address = SockaddrHv {
            family: AF_HYPERV,
            reserved: 0,
            vm_id,
            service_id,
        };
        let bound = unsafe {
            bind(
                listen_socket,
                std::ptr::addr_of!(address).cast(),
                size_of::<SockaddrHv>() as i32,
            )
        };
        if bound == SOCKET_ERROR {
            self.cancel();
            return Err(
                BridgeError::TransportOpen("cannot bind hyper-v socket".into()).into(),
            );
        }
        if unsafe { listen(listen_socket, 8) } == SOCKET_ERROR {
            self.cancel();
            return Err(
                BridgeError::TransportOpen("cannot listen on hyper-v socket".into())
                    .into(),
            );
        }
        info!(port = self.port, "listening for hyper-v socket clients");

        loop {
            let accepted = tokio::task::spawn_blocking(move || unsafe {
                accept(listen_socket, std::ptr::null_mut(), std::ptr::null_mut())
            })
            .await
            .context("accept task failed")?;

            if accepted == INVALID_SOCKET {
                if self.cancel.is_cancelled() {
                    break;
                }
                warn!("accept failed");
                continue;
            }

            // a connected hyper-v socket behaves like any stream socket
            let std_stream =
                unsafe { std::net::TcpStream::from_raw_socket(accepted as _) };
            if let Err(e) = std_stream.set_nonblocking(true) {
                warn!(error = %e, "cannot make accepted socket non-blocking");
                continue;
            }
            match tokio::net::TcpStream::from_std(std_stream) {
                Ok(stream) => {
                    debug!("accepted a hyper-v socket");
                    self.sink.delegate(stream, Handshake::None, self.label.clone());
                },
                Err(e) => warn!(error = %e, "cannot register accepted socket"),
            }
        }

        info!(listener = %self.label, "stopped gracefully");
        Ok(())
    }
}
