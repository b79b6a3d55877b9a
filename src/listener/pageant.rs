// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pageant compatibility listener: a window of class/title `Pageant`
//! serving `WM_COPYDATA` requests. There is no stream to delegate, so the
//! listener posts the decoded envelope straight to the dispatcher and
//! blocks inside the window procedure until the reply comes back; the
//! sender of `WM_COPYDATA` stays suspended until we return.

use std::sync::atomic::{AtomicIsize, Ordering};

use anyhow::{Context, Result, bail};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, HWND, LPARAM, LRESULT, WPARAM},
    System::{
        DataExchange::COPYDATASTRUCT,
        Memory::{FILE_MAP_WRITE, MapViewOfFile, OpenFileMappingA, UnmapViewOfFile},
        Threading::GetModuleHandleW,
    },
    UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DispatchMessageW, GWLP_USERDATA, GetMessageW,
        GetWindowLongPtrW, MSG, PostQuitMessage, RegisterClassW, SendMessageW,
        SetWindowLongPtrW, UnregisterClassW, WM_CLOSE, WM_COPYDATA, WNDCLASSW,
    },
};

use crate::{
    client::pageant::{AGENT_COPYDATA_ID, MAX_PAGEANT_MESSAGE_SIZE},
    dispatch::{DispatchHandle, PendingRequest},
    error::BridgeError,
    proto::frame::{HEADER_LEN, SshMessage},
};

/// UTF-16, nul-terminated "Pageant" for both window class and title.
const PAGEANT_NAME: [u16; 8] = [0x50, 0x61, 0x67, 0x65, 0x61, 0x6e, 0x74, 0];

struct WindowState {
    dispatch: DispatchHandle,
    cancel: CancellationToken,
}

pub struct PageantListener {
    label: String,
    dispatch: DispatchHandle,
    cancel: CancellationToken,
    window: AtomicIsize,
}

impl PageantListener {
    pub fn new(label: impl Into<String>, dispatch: DispatchHandle) -> Self {
        Self {
            label: label.into(),
            dispatch,
            cancel: CancellationToken::new(),
            window: AtomicIsize::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        let window = self.window.swap(0, Ordering::SeqCst);
        if window != 0 {
            unsafe {
                SendMessageW(window as HWND, WM_CLOSE, 0, 0);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(&self) -> Result<()> {
        let state = Box::new(WindowState {
            dispatch: self.dispatch.clone(),
            cancel: self.cancel.clone(),
        });
        // the raw handle travels as an integer so the future stays Send
        let window_value = create_window(Box::into_raw(state))?;
        self.window.store(window_value, Ordering::SeqCst);
        info!("listening for Pageant window messages");

        // the window message loop owns its thread until WM_CLOSE
        tokio::task::spawn_blocking(move || message_loop(window_value as HWND))
            .await
            .context("pageant message loop task failed")??;

        info!(listener = %self.label, "stopped gracefully");
        Ok(())
    }
}

fn create_window(state: *mut WindowState) -> Result<isize> {
    unsafe {
        let instance = GetModuleHandleW(std::ptr::null());
        let mut class: WNDCLASSW = std::mem::zeroed();
        class.lpszClassName = PAGEANT_NAME.as_ptr();
        class.lpfnWndProc = Some(window_procedure);
        class.hInstance = instance;
        if RegisterClassW(&class) == 0 {
            drop(Box::from_raw(state));
            return Err(BridgeError::TransportOpen(format!(
                "cannot register Pageant window class: {}",
                GetLastError()
            ))
            .into());
        }

        let window = CreateWindowExW(
            0,
            PAGEANT_NAME.as_ptr(),
            PAGEANT_NAME.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            instance,
            std::ptr::null(),
        );
        if window.is_null() {
            UnregisterClassW(PAGEANT_NAME.as_ptr(), instance);
            drop(Box::from_raw(state));
            return Err(BridgeError::TransportOpen(format!(
                "cannot create Pageant window: {}",
                GetLastError()
            ))
            .into());
        }

        SetWindowLongPtrW(window, GWLP_USERDATA, state as isize);
        Ok(window as isize)
    }
}

fn message_loop(window: HWND) -> Result<()> {
    unsafe {
        let mut message: MSG = std::mem::zeroed();
        loop {
            let status = GetMessageW(&mut message, window, 0, 0);
            if status == 0 {
                break;
            }
            if status == -1 {
                bail!("GetMessage failed: {}", GetLastError());
            }
            DispatchMessageW(&message);
        }

        // release the state installed by create_window
        let state = GetWindowLongPtrW(window, GWLP_USERDATA) as *mut WindowState;
        SetWindowLongPtrW(window, GWLP_USERDATA, 0);
        if !state.is_null() {
            drop(Box::from_raw(state));
        }
        UnregisterClassW(PAGEANT_NAME.as_ptr(), GetModuleHandleW(std::ptr::null()));
    }
    Ok(())
}

unsafe extern "system" fn window_procedure(
    window: HWND,
    message_id: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match message_id {
        WM_COPYDATA => {
            let cds = lparam as *const COPYDATASTRUCT;
            let state =
                unsafe { GetWindowLongPtrW(window, GWLP_USERDATA) } as *const WindowState;
            if cds.is_null() || state.is_null() {
                return 0;
            }
            if unsafe { (*cds).dwData } != AGENT_COPYDATA_ID {
                return 0;
            }
            match unsafe { process_request(&*state, &*cds) } {
                Ok(()) => 1,
                Err(e) => {
                    debug!(error = %e, "pageant request failed");
                    0
                },
            }
        },
        WM_CLOSE => {
            unsafe { PostQuitMessage(0) };
            0
        },
        _ => unsafe { DefWindowProcW(window, message_id, wparam, lparam) },
    }
}

/// Decodes the shared-memory request, round-trips it through the
/// dispatcher, and writes the reply back in place.
unsafe fn process_request(state: &WindowState, cds: &COPYDATASTRUCT) -> Result<()> {
    if state.cancel.is_cancelled() {
        bail!("listener cancelled");
    }

    // map name must be a nul-terminated string
    let name = std::slice::from_raw_parts(cds.lpData as *const u8, cds.cbData as usize);
    if name.last() != Some(&0) {
        bail!("map name is not terminated");
    }

    let mapping = OpenFileMappingA(FILE_MAP_WRITE, 0, name.as_ptr());
    if mapping.is_null() {
        bail!("cannot open provided file mapping");
    }

    let result = (|| {
        let view = MapViewOfFile(mapping, FILE_MAP_WRITE, 0, 0, 0);
        if view.Value.is_null() {
            bail!("cannot map request memory");
        }
        let mem = view.Value.cast::<u8>();

        let outcome = (|| {
            let mut header = [0u8; HEADER_LEN];
            std::ptr::copy_nonoverlapping(mem, header.as_mut_ptr(), HEADER_LEN);
            let length = u32::from_be_bytes(header) as usize;
            if length + HEADER_LEN > MAX_PAGEANT_MESSAGE_SIZE {
                bail!("request too long: {length}");
            }

            let mut data = vec![0u8; length];
            std::ptr::copy_nonoverlapping(mem.add(HEADER_LEN), data.as_mut_ptr(), length);
            let msg = SshMessage::new(data);
            debug!(length, opcode = msg.opcode(), "recv message");

            let (tx, rx) = oneshot::channel();
            state
                .dispatch
                .send(PendingRequest { msg, reply: tx })
                .map_err(|_| anyhow::anyhow!("dispatcher unavailable"))?;

            // the WM_COPYDATA sender stays suspended until we return
            let reply = rx.blocking_recv().context("no reply from dispatcher")?;
            if !reply.ok {
                bail!("no valid reply received");
            }
            let reply = reply.msg;
            debug!(length = reply.len(), opcode = reply.opcode(), "send message");

            if reply.len() + HEADER_LEN > MAX_PAGEANT_MESSAGE_SIZE {
                bail!("reply too long: {}", reply.len());
            }
            std::ptr::copy_nonoverlapping(reply.header().as_ptr(), mem, HEADER_LEN);
            std::ptr::copy_nonoverlapping(
                reply.data.as_ptr(),
                mem.add(HEADER_LEN),
                reply.len(),
            );
            Ok(())
        })();

        UnmapViewOfFile(view);
        outcome
    })();

    CloseHandle(mapping);
    if let Err(e) = &result {
        error!(error = %e, "pageant request processing failed");
    }
    result
}
