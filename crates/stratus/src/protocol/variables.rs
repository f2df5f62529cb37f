// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Registered cloud-readable variables.
//!
//! A variable request is a GET on `v` with the key as a second Uri-Path
//! option and an optional argument as a Uri-Query option. The response is a
//! piggybacked `2.05 Content` whose payload encoding depends on the
//! registered type: bool as one byte, i32 as 4 bytes, i64 truncated to 48
//! bits, f64 as 8 bytes, strings and JSON verbatim.
//!
//! Oversize arguments are answered with a coded `4.00`, never truncated.

use crate::coap::{codec, Message, MessageChannel};
use crate::config::{MAX_ARG_LEN, MAX_KEY_LEN};
use crate::protocol::{Error, Result};

/// A value produced by a variable accessor.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Json(String),
}

impl VariableValue {
    /// Type digit used in the describe document.
    #[must_use]
    pub fn type_digit(&self) -> char {
        match self {
            VariableValue::Bool(_) => '1',
            VariableValue::Int32(_) => '2',
            VariableValue::String(_) => '4',
            VariableValue::Int64(_) => '6',
            VariableValue::Json(_) => '7',
            VariableValue::Double(_) => '9',
        }
    }
}

/// Declared type of a registered variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Bool,
    Int32,
    Int64,
    Double,
    String,
    Json,
}

impl VariableKind {
    /// Type digit used in the describe document.
    #[must_use]
    pub fn digit(self) -> char {
        match self {
            VariableKind::Bool => '1',
            VariableKind::Int32 => '2',
            VariableKind::String => '4',
            VariableKind::Int64 => '6',
            VariableKind::Json => '7',
            VariableKind::Double => '9',
        }
    }
}

/// Accessor invoked with the request argument.
pub type VariableAccessor = Box<dyn FnMut(&str) -> VariableValue>;

struct Variable {
    key: String,
    type_digit: char,
    accessor: VariableAccessor,
}

/// The registered-variables table.
#[derive(Default)]
pub struct VariableRegistry {
    variables: Vec<Variable>,
}

impl VariableRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable.
    ///
    /// The declared kind must match what the accessor returns; it is what
    /// the describe document advertises. Keys are truncated to the maximum;
    /// empty and duplicate keys are rejected.
    pub fn add(&mut self, key: &str, kind: VariableKind, accessor: VariableAccessor) -> bool {
        if key.is_empty() {
            log::warn!("[vars] empty variable key rejected");
            return false;
        }
        let mut key = key.to_string();
        key.truncate(MAX_KEY_LEN);
        if self.variables.iter().any(|v| v.key == key) {
            log::warn!("[vars] variable \"{}\" already registered", key);
            return false;
        }
        log::trace!("[vars] registered \"{}\" type={}", key, kind.digit());
        self.variables.push(Variable {
            key,
            type_digit: kind.digit(),
            accessor,
        });
        true
    }

    /// (key, type digit) pairs for the describe document.
    pub fn describe_entries(&self) -> impl Iterator<Item = (&str, char)> {
        self.variables.iter().map(|v| (v.key.as_str(), v.type_digit))
    }

    /// Number of registered variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// True when no variable is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Answer one variable request.
    pub fn handle_request(
        &mut self,
        message: &Message,
        token: u8,
        message_id: u16,
        channel: &mut dyn MessageChannel,
    ) -> Result<()> {
        let (key, arg) = match decode_variable_request(message) {
            Ok(decoded) => decoded,
            Err(Error::Protocol) => {
                // Oversize or malformed argument: 4.00.
                let mut response = Message::from_bytes(codec::coded_ack_token(
                    token,
                    crate::coap::code::BAD_REQUEST,
                    message_id,
                ));
                response.set_id(message_id);
                return channel.send(&mut response);
            }
            Err(other) => return Err(other),
        };

        let Some(variable) = self.variables.iter_mut().find(|v| v.key == key) else {
            log::debug!("[vars] unknown variable \"{}\"", key);
            let mut response = Message::from_bytes(codec::coded_ack_token(
                token,
                crate::coap::code::NOT_FOUND,
                message_id,
            ));
            response.set_id(message_id);
            return channel.send(&mut response);
        };

        let value = (variable.accessor)(&arg);
        let bytes = match value {
            VariableValue::Bool(v) => codec::variable_bool(message_id, token, v),
            VariableValue::Int32(v) => codec::variable_i32(message_id, token, v),
            VariableValue::Int64(v) => codec::variable_i64(message_id, token, v),
            VariableValue::Double(v) => codec::variable_double(message_id, token, v),
            VariableValue::String(v) | VariableValue::Json(v) => {
                codec::variable_bytes(message_id, token, v.as_bytes())
            }
        };
        let mut response = Message::from_bytes(bytes);
        response.set_id(message_id);
        channel.send(&mut response)
    }
}

/// Decode a variable request into (key, argument).
///
/// The key (second Uri-Path option) is truncated to the key maximum and the
/// call proceeds; an argument past the argument maximum is a hard
/// [`Error::Protocol`] answered with `4.00`.
pub fn decode_variable_request(message: &Message) -> Result<(String, String)> {
    let mut key = None;
    let mut arg = String::new();
    for (number, value) in message.options() {
        match number {
            crate::coap::option::URI_PATH => {
                if value.len() == 1 && key.is_none() && matches!(value[0], b'v' | b'f' | b'p') {
                    continue; // the route marker
                }
                if key.is_none() {
                    let mut k = String::from_utf8_lossy(value).into_owned();
                    k.truncate(MAX_KEY_LEN);
                    key = Some(k);
                }
            }
            crate::coap::option::URI_QUERY => {
                if value.len() > MAX_ARG_LEN {
                    return Err(Error::Protocol);
                }
                arg = String::from_utf8_lossy(value).into_owned();
            }
            _ => {}
        }
    }
    let key = key.ok_or(Error::Protocol)?;
    Ok((key, arg))
}
