//! Host functions a guest imports from the `bridge` module.
//!
//! Every scope gets its own linker with these definitions, so handles and
//! channels never leak between scopes.

mod state;

use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use crossbeam_channel::{SendTimeoutError, TrySendError};
use tracing::debug;
use wasmtime::{Caller, Extern, Linker, Memory};

pub use self::state::ScopeState;
use super::{
    channel::{ChannelKind, DeclareError, Envelope, PayloadKind},
    logging,
};
use crate::message::Headers;

pub const MODULE: &str = "bridge";

pub const FUNCTIONS: &[&str] = &[
    "channel_declare",
    "message_new",
    "message_kind",
    "message_len",
    "message_read",
    "header_set",
    "emit",
    "message_drop",
    "log",
];

const STATUS_OK: i32 = 0;
const STATUS_FULL: i32 = 1;
const STATUS_INVALID: i32 = -1;
const STATUS_DUPLICATE: i32 = -2;

fn memory(caller: &mut Caller<'_, ScopeState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export `memory`"))
}

fn read_bytes(
    caller: &mut Caller<'_, ScopeState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    let memory = memory(caller)?;
    let ptr = usize::try_from(ptr)?;
    let len = usize::try_from(len)?;
    let mut buf = vec![0; len];
    memory.read(&*caller, ptr, &mut buf)?;
    Ok(buf)
}

/// Reads a UTF-8 string out of guest memory. `None` when it is not UTF-8.
fn read_str(
    caller: &mut Caller<'_, ScopeState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Option<String>> {
    Ok(String::from_utf8(read_bytes(caller, ptr, len)?).ok())
}

pub fn add_to_linker(linker: &mut Linker<ScopeState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        MODULE,
        "channel_declare",
        |mut caller: Caller<'_, ScopeState>,
         ptr: i32,
         len: i32,
         kind: i32|
         -> wasmtime::Result<i32> {
            let Some(name) = read_str(&mut caller, ptr, len)? else {
                return Ok(STATUS_INVALID);
            };
            let Some(kind) = ChannelKind::from_code(kind) else {
                return Ok(STATUS_INVALID);
            };
            if name.is_empty() {
                return Ok(STATUS_INVALID);
            }
            Ok(match caller.data_mut().channels.declare(&name, kind) {
                Ok(()) => {
                    debug!(channel = %name, ?kind, "guest declared channel");
                    STATUS_OK
                }
                Err(DeclareError::Duplicate) => STATUS_DUPLICATE,
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "message_new",
        |mut caller: Caller<'_, ScopeState>,
         kind: i32,
         ptr: i32,
         len: i32|
         -> wasmtime::Result<i32> {
            let data = read_bytes(&mut caller, ptr, len)?;
            let envelope = Envelope {
                kind: PayloadKind::from_code(kind),
                data: Bytes::from(data),
                headers: Headers::new(),
            };
            Ok(caller.data_mut().messages.insert(envelope))
        },
    )?;

    linker.func_wrap(
        MODULE,
        "message_kind",
        |caller: Caller<'_, ScopeState>, handle: i32| -> i32 {
            caller
                .data()
                .messages
                .get(handle)
                .map_or(STATUS_INVALID, |envelope| envelope.kind.code())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "message_len",
        |caller: Caller<'_, ScopeState>, handle: i32| -> wasmtime::Result<i32> {
            match caller.data().messages.get(handle) {
                Some(envelope) => Ok(i32::try_from(envelope.data.len())?),
                None => Ok(STATUS_INVALID),
            }
        },
    )?;

    linker.func_wrap(
        MODULE,
        "message_read",
        |mut caller: Caller<'_, ScopeState>, handle: i32, ptr: i32| -> wasmtime::Result<i32> {
            let Some(data) = caller
                .data()
                .messages
                .get(handle)
                .map(|envelope| envelope.data.clone())
            else {
                return Ok(STATUS_INVALID);
            };
            let memory = memory(&mut caller)?;
            memory.write(&mut caller, usize::try_from(ptr)?, &data)?;
            Ok(i32::try_from(data.len())?)
        },
    )?;

    linker.func_wrap(
        MODULE,
        "header_set",
        |mut caller: Caller<'_, ScopeState>,
         handle: i32,
         key_ptr: i32,
         key_len: i32,
         val_ptr: i32,
         val_len: i32|
         -> wasmtime::Result<i32> {
            let key = read_str(&mut caller, key_ptr, key_len)?;
            let value = read_str(&mut caller, val_ptr, val_len)?;
            let (Some(key), Some(value)) = (key, value) else {
                return Ok(STATUS_INVALID);
            };
            Ok(match caller.data_mut().messages.get_mut(handle) {
                Some(envelope) => {
                    envelope.set_header(key, value);
                    STATUS_OK
                }
                None => STATUS_INVALID,
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "emit",
        |mut caller: Caller<'_, ScopeState>,
         handle: i32,
         name_ptr: i32,
         name_len: i32,
         timeout_ms: i64|
         -> wasmtime::Result<i32> {
            let Some(name) = read_str(&mut caller, name_ptr, name_len)? else {
                return Ok(STATUS_INVALID);
            };
            let state = caller.data_mut();
            let Some(queue) = state.channels.queue(&name).cloned() else {
                return Ok(STATUS_INVALID);
            };
            let Some(envelope) = state.messages.remove(handle) else {
                return Ok(STATUS_INVALID);
            };

            let rejected = match u64::try_from(timeout_ms) {
                Ok(ms) if ms > 0 => match queue.send_timeout(envelope, Duration::from_millis(ms)) {
                    Ok(()) => None,
                    Err(SendTimeoutError::Timeout(envelope)) => Some((envelope, STATUS_FULL)),
                    Err(SendTimeoutError::Disconnected(envelope)) => {
                        Some((envelope, STATUS_INVALID))
                    }
                },
                _ => match queue.try_send(envelope) {
                    Ok(()) => None,
                    Err(TrySendError::Full(envelope)) => Some((envelope, STATUS_FULL)),
                    Err(TrySendError::Disconnected(envelope)) => Some((envelope, STATUS_INVALID)),
                },
            };

            Ok(match rejected {
                None => STATUS_OK,
                Some((envelope, status)) => {
                    caller.data_mut().messages.restore(handle, envelope);
                    status
                }
            })
        },
    )?;

    linker.func_wrap(
        MODULE,
        "message_drop",
        |mut caller: Caller<'_, ScopeState>, handle: i32| {
            caller.data_mut().messages.remove(handle);
        },
    )?;

    linker.func_wrap(
        MODULE,
        "log",
        |mut caller: Caller<'_, ScopeState>,
         level: i32,
         ptr: i32,
         len: i32|
         -> wasmtime::Result<()> {
            let bytes = read_bytes(&mut caller, ptr, len)?;
            logging::log(level, &String::from_utf8_lossy(&bytes));
            Ok(())
        },
    )?;

    Ok(())
}
