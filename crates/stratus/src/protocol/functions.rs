// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Registered cloud-callable functions.
//!
//! A function call is a POST on `f` with the key as a second Uri-Path
//! option, the caller identity as an optional Uri-Query option, and the
//! argument in the payload. The result is a 10-byte `2.04` ACK carrying the
//! function's i32 return value. Failures are coded ACKs: `4.00` invalid
//! arguments, `4.03` not authorized, `4.04` no such function.

use crate::coap::{code, codec, Message, MessageChannel};
use crate::config::{MAX_ARG_LEN, MAX_KEY_LEN};
use crate::protocol::{Error, Result};

/// Who may invoke a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionPermission {
    /// Any authenticated caller.
    AllUsers,
    /// Only callers in the device's owner list.
    OwnerOnly,
}

/// Handler invoked with the call argument; the i32 goes back to the broker.
pub type CloudFunction = Box<dyn FnMut(&str) -> i32>;

struct Function {
    key: String,
    handler: CloudFunction,
    permission: FunctionPermission,
}

/// Decoded function/property call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub key: String,
    pub arg: String,
    pub caller_id: Option<String>,
}

/// Decode a function or property call message.
///
/// The key is truncated to the maximum and the call proceeds; an oversize
/// argument is a hard [`Error::Protocol`] the caller answers with `4.00`.
pub fn decode_call(message: &Message) -> Result<CallRequest> {
    let mut key = None;
    let mut caller_id = None;
    for (number, value) in message.options() {
        match number {
            crate::coap::option::URI_PATH => {
                if value.len() == 1 && key.is_none() && matches!(value[0], b'f' | b'p') {
                    continue; // the route marker
                }
                if key.is_none() {
                    let mut k = String::from_utf8_lossy(value).into_owned();
                    k.truncate(MAX_KEY_LEN);
                    key = Some(k);
                }
            }
            crate::coap::option::URI_QUERY => {
                caller_id = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {}
        }
    }
    let key = key.ok_or(Error::Protocol)?;
    let payload = message.payload();
    if payload.len() > MAX_ARG_LEN {
        return Err(Error::Protocol);
    }
    Ok(CallRequest {
        key,
        arg: String::from_utf8_lossy(payload).into_owned(),
        caller_id,
    })
}

/// The registered-functions table.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: Vec<Function>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Keys are truncated to the maximum; empty and
    /// duplicate keys are rejected.
    pub fn add(
        &mut self,
        key: &str,
        handler: CloudFunction,
        permission: FunctionPermission,
    ) -> bool {
        if key.is_empty() {
            log::warn!("[funcs] empty function key rejected");
            return false;
        }
        let mut key = key.to_string();
        key.truncate(MAX_KEY_LEN);
        if self.functions.iter().any(|f| f.key == key) {
            log::warn!("[funcs] function \"{}\" already registered", key);
            return false;
        }
        log::trace!("[funcs] registered \"{}\"", key);
        self.functions.push(Function {
            key,
            handler,
            permission,
        });
        true
    }

    /// Function keys for the describe document.
    pub fn describe_entries(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.key.as_str())
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when no function is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Execute one call and answer it.
    ///
    /// `is_owner` decides OwnerOnly access; the facade derives it from the
    /// caller id against the owner list.
    pub fn handle_call(
        &mut self,
        message: &Message,
        token: u8,
        message_id: u16,
        is_owner: impl Fn(Option<&str>) -> bool,
        channel: &mut dyn MessageChannel,
    ) -> Result<()> {
        let reply = |reply_code: u8| codec::coded_ack_token(token, reply_code, message_id);

        let request = match decode_call(message) {
            Ok(request) => request,
            Err(Error::Protocol) => {
                let mut response = Message::from_bytes(reply(code::BAD_REQUEST));
                response.set_id(message_id);
                return channel.send(&mut response);
            }
            Err(other) => return Err(other),
        };

        let Some(function) = self.functions.iter_mut().find(|f| f.key == request.key) else {
            log::debug!("[funcs] unknown function \"{}\"", request.key);
            let mut response = Message::from_bytes(reply(code::NOT_FOUND));
            response.set_id(message_id);
            return channel.send(&mut response);
        };

        if function.permission == FunctionPermission::OwnerOnly
            && !is_owner(request.caller_id.as_deref())
        {
            log::debug!("[funcs] caller not authorized for \"{}\"", request.key);
            let mut response = Message::from_bytes(reply(code::FORBIDDEN));
            response.set_id(message_id);
            return channel.send(&mut response);
        }

        let result = (function.handler)(&request.arg);
        log::trace!("[funcs] \"{}\"({:?}) = {}", request.key, request.arg, result);
        let mut response = Message::from_bytes(codec::function_return(message_id, token, result));
        response.set_id(message_id);
        channel.send(&mut response)
    }
}
