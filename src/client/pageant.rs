// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pageant IPC client: requests travel through a named shared-memory
//! section announced to the Pageant window with `WM_COPYDATA`; the server
//! writes the reply in place and returns non-zero.

use anyhow::{Result, anyhow, bail};
use tracing::debug;

use crate::{
    client::{AgentClient, ExchangeFuture},
    proto::frame::{HEADER_LEN, SshMessage},
};

/// `dwData` magic identifying an agent request.
pub const AGENT_COPYDATA_ID: usize = 0x804e_50ba;
/// Section size; requests and replies must fit, header included.
pub const MAX_PAGEANT_MESSAGE_SIZE: usize = 8192;

/// UTF-16, nul-terminated "Pageant" for both window class and title.
const PAGEANT_NAME: [u16; 8] = [0x50, 0x61, 0x67, 0x65, 0x61, 0x6e, 0x74, 0];

#[derive(Debug)]
pub struct PageantClient {
    label: String,
}

impl PageantClient {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn round_trip_blocking(request: &[u8]) -> Result<Vec<u8>> {
        use windows_sys::Win32::{
            Foundation::{CloseHandle, INVALID_HANDLE_VALUE},
            System::{
                DataExchange::COPYDATASTRUCT,
                Memory::{
                    CreateFileMappingA, FILE_MAP_WRITE, MapViewOfFile, PAGE_READWRITE,
                    UnmapViewOfFile,
                },
                Threading::GetCurrentThreadId,
            },
            UI::WindowsAndMessaging::{FindWindowW, SendMessageW, WM_COPYDATA},
        };

        if request.len() + HEADER_LEN > MAX_PAGEANT_MESSAGE_SIZE {
            bail!("message too long for Pageant: {}", request.len());
        }

        let window = unsafe { FindWindowW(PAGEANT_NAME.as_ptr(), PAGEANT_NAME.as_ptr()) };
        if window.is_null() {
            bail!("cannot find Pageant communication window");
        }

        // section name is "PageantRequest" + zero-padded thread id, nul terminated
        let map_name =
            format!("PageantRequest{:08x}\0", unsafe { GetCurrentThreadId() });

        let mapping = unsafe {
            CreateFileMappingA(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                0,
                MAX_PAGEANT_MESSAGE_SIZE as u32,
                map_name.as_ptr(),
            )
        };
        if mapping.is_null() {
            bail!("cannot create file mapping for Pageant request");
        }

        let result = (|| {
            let view = unsafe { MapViewOfFile(mapping, FILE_MAP_WRITE, 0, 0, 0) };
            if view.Value.is_null() {
                bail!("cannot map Pageant request memory");
            }
            let mem = view.Value.cast::<u8>();

            let reply = (|| {
                unsafe {
                    let header = (request.len() as u32).to_be_bytes();
                    std::ptr::copy_nonoverlapping(header.as_ptr(), mem, HEADER_LEN);
                    std::ptr::copy_nonoverlapping(
                        request.as_ptr(),
                        mem.add(HEADER_LEN),
                        request.len(),
                    );
                }

                let cds = COPYDATASTRUCT {
                    dwData: AGENT_COPYDATA_ID,
                    cbData: map_name.len() as u32,
                    lpData: map_name.as_ptr().cast_mut().cast(),
                };

                let sent = unsafe {
                    SendMessageW(
                        window,
                        WM_COPYDATA,
                        0,
                        std::ptr::addr_of!(cds) as isize,
                    )
                };
                if sent == 0 {
                    bail!("Pageant rejected the request");
                }

                let mut header = [0u8; HEADER_LEN];
                unsafe {
                    std::ptr::copy_nonoverlapping(mem, header.as_mut_ptr(), HEADER_LEN);
                }
                let length = u32::from_be_bytes(header) as usize;
                if length + HEADER_LEN > MAX_PAGEANT_MESSAGE_SIZE {
                    bail!("Pageant reply too long: {length}");
                }
                let mut reply = vec![0u8; length];
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        mem.add(HEADER_LEN),
                        reply.as_mut_ptr(),
                        length,
                    );
                }
                Ok(reply)
            })();

            unsafe {
                UnmapViewOfFile(view);
            }
            reply
        })();

        unsafe {
            CloseHandle(mapping);
        }
        result
    }
}

impl AgentClient for PageantClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn exchange<'a>(&'a self, msg: &'a mut SshMessage) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let request = std::mem::take(&mut msg.data);
            debug!(length = request.len(), "sending request to Pageant");
            let reply =
                tokio::task::spawn_blocking(move || Self::round_trip_blocking(&request))
                    .await
                    .map_err(|e| anyhow!("Pageant exchange task failed: {e}"))??;
            msg.data = reply;
            Ok(())
        })
    }
}
