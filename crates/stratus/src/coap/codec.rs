// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Wire codec: one encoder per message the device emits, plus the
//! type-dispatch decoder for inbound frames.
//!
//! The broker addresses every feature with a single-character Uri-Path:
//! `h` Hello, `d` Describe, `f` function call, `v` variable request, `p`
//! property update, `u` update begin/done, `s` save-begin / signal, `c`
//! chunk, `k` key change, `t` time, `e`/`E` event. Inbound frames are
//! classified by CoAP code plus that first path character.

use super::{code, CoapType, Message};
use crate::config::{MAX_BLOCK_SIZE, MAX_EVENT_NAME_LEN};
use crate::protocol::EventType;

/// Byte length of a function-return frame.
pub const FUNCTION_RETURN_SIZE: usize = 10;

/// Classified inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapMessageType {
    Hello,
    Describe,
    FunctionCall,
    VariableRequest,
    Event,
    SaveBegin,
    UpdateBegin,
    UpdateDone,
    Chunk,
    KeyChange,
    UpdateProperty,
    SignalStart,
    SignalStop,
    Time,
    Ping,
    EmptyAck,
    /// Not decodable; drop the datagram.
    Error,
    /// Nothing received this pass.
    None,
}

/// Classify an inbound frame by code and first Uri-Path character.
#[must_use]
pub fn decode_type(frame: &[u8]) -> CoapMessageType {
    if frame.len() < 4 {
        return CoapMessageType::Error;
    }
    // 4-byte header, token, then one option header byte before the path.
    let path_idx = 5 + usize::from(frame[0] & 0x0F);
    let path = frame.get(path_idx).copied().unwrap_or(0);

    match frame[1] {
        code::GET => match path {
            b'v' => CoapMessageType::VariableRequest,
            b'd' => CoapMessageType::Describe,
            _ => CoapMessageType::Error,
        },
        code::POST => match path {
            b'e' | b'E' => CoapMessageType::Event,
            b'h' => CoapMessageType::Hello,
            b'f' => CoapMessageType::FunctionCall,
            b's' => CoapMessageType::SaveBegin,
            b'u' => CoapMessageType::UpdateBegin,
            b'c' => CoapMessageType::Chunk,
            _ => CoapMessageType::Error,
        },
        code::PUT => match path {
            b'k' => CoapMessageType::KeyChange,
            b'p' => CoapMessageType::UpdateProperty,
            b'u' => CoapMessageType::UpdateDone,
            b's' => {
                if frame.get(8).copied().unwrap_or(0) != 0 {
                    CoapMessageType::SignalStart
                } else {
                    CoapMessageType::SignalStop
                }
            }
            _ => CoapMessageType::Error,
        },
        code::EMPTY => match CoapType::of(frame) {
            Some(CoapType::Confirmable) => CoapMessageType::Ping,
            _ => CoapMessageType::EmptyAck,
        },
        code::CONTENT => CoapMessageType::Time,
        _ => CoapMessageType::Error,
    }
}

// =======================================================================
// Bootstrap and housekeeping messages
// =======================================================================

/// Hello: POST `h` announcing product metadata and capability flags.
///
/// Payload: `product_id(2) | firmware_version(2) | reserved(1) | flags(1) |
/// platform_id(2) | device_id_len(2) | device_id`.
#[must_use]
pub fn hello(
    message_id: u16,
    flags: u8,
    platform_id: u16,
    product_id: u16,
    firmware_version: u16,
    confirmable: bool,
    device_id: &[u8],
) -> Vec<u8> {
    let coap_type = if confirmable {
        CoapType::Confirmable
    } else {
        CoapType::NonConfirmable
    };
    let mut buf = Vec::with_capacity(17 + device_id.len());
    buf.push(coap_type.header_byte(0));
    buf.push(code::POST);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(0xB1); // Uri-Path option of length 1
    buf.push(b'h');
    buf.push(0xFF);
    buf.extend_from_slice(&product_id.to_be_bytes());
    buf.extend_from_slice(&firmware_version.to_be_bytes());
    buf.push(0); // reserved flags
    buf.push(flags);
    buf.extend_from_slice(&platform_id.to_be_bytes());
    if !device_id.is_empty() {
        buf.extend_from_slice(&(device_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(device_id);
    }
    buf
}

/// Empty CON ping keeping the session warm.
#[must_use]
pub fn ping(message_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.push(0x40); // Confirmable, no token
    buf.push(code::EMPTY);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf
}

/// 1-byte NAT keepalive padding; the broker discards it.
#[must_use]
pub fn keep_alive() -> Vec<u8> {
    vec![0x70]
}

/// GET `t` requesting the broker's UNIX time.
#[must_use]
pub fn time_request(message_id: u16, token: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7);
    buf.push(0x41); // Confirmable, one-byte token
    buf.push(code::GET);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(token);
    buf.push(0xB1);
    buf.push(b't');
    buf
}

/// Extract the 32-bit UNIX time from a `2.05 Content` time response.
///
/// The response carries no options: header, token, marker, 4 bytes of time.
#[must_use]
pub fn decode_time_response(frame: &[u8]) -> Option<u32> {
    let payload_idx = 4 + usize::from(frame.first()? & 0x0F);
    if frame.get(payload_idx)? != &0xFF {
        return None;
    }
    let t = frame.get(payload_idx + 1..payload_idx + 5)?;
    Some(u32::from_be_bytes([t[0], t[1], t[2], t[3]]))
}

// =======================================================================
// Acknowledgements and responses
// =======================================================================

/// Empty ACK for the given message id bytes.
#[must_use]
pub fn empty_ack(message_id: u16) -> Vec<u8> {
    coded_ack(0, message_id)
}

/// Tokenless coded ACK.
#[must_use]
pub fn coded_ack(reply_code: u8, message_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.push(0x60); // acknowledgement, no token
    buf.push(reply_code);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf
}

/// Coded ACK echoing a one-byte token.
#[must_use]
pub fn coded_ack_token(token: u8, reply_code: u8, message_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(0x61); // acknowledgement, one-byte token
    buf.push(reply_code);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(token);
    buf
}

/// Coded ACK with token and payload.
#[must_use]
pub fn coded_ack_payload(token: u8, reply_code: u8, message_id: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = coded_ack_token(token, reply_code, message_id);
    if !data.is_empty() {
        buf.push(0xFF);
        buf.extend_from_slice(data);
    }
    buf
}

/// RESET frame rejecting the given message id.
#[must_use]
pub fn reset(message_id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.push(0x70); // reset, no token
    buf.push(0);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf
}

/// Separate (non-piggybacked) response with optional payload.
#[must_use]
pub fn separate_response(
    message_id: u16,
    token: u8,
    reply_code: u8,
    payload: &[u8],
    confirmable: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.push(if confirmable { 0x41 } else { 0x51 });
    buf.push(reply_code);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(token);
    if !payload.is_empty() {
        buf.push(0xFF);
        buf.extend_from_slice(payload);
    }
    buf
}

// =======================================================================
// Function and variable responses
// =======================================================================

/// 2.04 ACK carrying the function's big-endian i32 result; always 10 bytes.
#[must_use]
pub fn function_return(message_id: u16, token: u8, return_value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FUNCTION_RETURN_SIZE);
    buf.push(0x61); // acknowledgement, one-byte token
    buf.push(code::CHANGED);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(token);
    buf.push(0xFF);
    buf.extend_from_slice(&return_value.to_be_bytes());
    buf
}

/// 2.05 ACK prelude: header, token, payload marker.
#[must_use]
pub fn content(message_id: u16, token: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.push(0x61);
    buf.push(code::CONTENT);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(token);
    buf.push(0xFF);
    buf
}

/// Variable response: bool as one byte.
#[must_use]
pub fn variable_bool(message_id: u16, token: u8, value: bool) -> Vec<u8> {
    let mut buf = content(message_id, token);
    buf.push(u8::from(value));
    buf
}

/// Variable response: i32 big-endian.
#[must_use]
pub fn variable_i32(message_id: u16, token: u8, value: i32) -> Vec<u8> {
    let mut buf = content(message_id, token);
    buf.extend_from_slice(&value.to_be_bytes());
    buf
}

/// Variable response: i64 truncated to its low 48 bits, big-endian.
///
/// Sign extension of the 6-byte value is the broker's business.
#[must_use]
pub fn variable_i64(message_id: u16, token: u8, value: i64) -> Vec<u8> {
    let mut buf = content(message_id, token);
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[2..8]);
    buf
}

/// Variable response: f64, native byte order as the broker expects the raw
/// IEEE-754 image.
#[must_use]
pub fn variable_double(message_id: u16, token: u8, value: f64) -> Vec<u8> {
    let mut buf = content(message_id, token);
    buf.extend_from_slice(&value.to_ne_bytes());
    buf
}

/// Variable response: string/json copied verbatim.
#[must_use]
pub fn variable_bytes(message_id: u16, token: u8, value: &[u8]) -> Vec<u8> {
    let mut buf = content(message_id, token);
    buf.extend_from_slice(value);
    buf
}

// =======================================================================
// Describe
// =======================================================================

/// Header of a device-initiated describe: POST `d` with a one-byte
/// Uri-Query flag, ending at the payload marker.
#[must_use]
pub fn describe_post_header(message_id: u16, desc_flags: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(0x40); // Confirmable, no token
    buf.push(code::POST);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(0xB1);
    buf.push(b'd');
    buf.push(0x41); // Uri-Query option of length 1
    buf.push(desc_flags);
    buf.push(0xFF);
    buf
}

// =======================================================================
// Events and subscriptions
// =======================================================================

/// Event-name Uri-Path option body (delta 0 from the marker option).
fn event_name_uri_path(buf: &mut Vec<u8>, name: &[u8]) {
    if name.is_empty() {
        return;
    }
    if name.len() < 13 {
        buf.push(name.len() as u8);
    } else {
        buf.push(0x0D);
        buf.push((name.len() - 13) as u8);
    }
    buf.extend_from_slice(name);
}

/// POST `e`/`E` publishing an event, optionally one block of a block-wise
/// transfer.
///
/// The TTL option (3-byte big-endian) is elided when `ttl == 60`. The
/// Block1 option is present when `block_num > 1`: SZX=6 (1024-byte blocks),
/// sequence in the high nibble, M-bit set on every block but the last.
#[must_use]
pub fn event(
    message_id: u16,
    token: u8,
    event_name: &str,
    data: &[u8],
    ttl: u32,
    block_id: u8,
    block_num: u8,
    event_type: EventType,
    confirmable: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + event_name.len() + data.len());

    let mut first = if confirmable { 0x40 } else { 0x50 };
    if token > 0 {
        first += 1; // one-byte token
    }
    buf.push(first);
    buf.push(code::POST);
    buf.extend_from_slice(&message_id.to_be_bytes());
    if token > 0 {
        buf.push(token);
    }

    buf.push(0xB1); // one-byte Uri-Path option
    buf.push(event_type.marker());

    let name = event_name.as_bytes();
    let name = &name[..name.len().min(MAX_EVENT_NAME_LEN)];
    event_name_uri_path(&mut buf, name);

    // Block1 option delta depends on whether the TTL option came first.
    let mut block1_delta: [u8; 2] = [0xD1, 0x03];

    if ttl != 60 {
        buf.push(0x33); // delta 3 from Uri-Path, length 3
        buf.push((ttl >> 16) as u8);
        buf.push((ttl >> 8) as u8);
        buf.push(ttl as u8);
        block1_delta = [0xD1, 0x00];
    }

    if block_num > 1 {
        buf.extend_from_slice(&block1_delta);
        let mut block_byte = 0x06u8; // SZX=6: 1024-byte blocks
        block_byte |= block_id << 4;
        if block_id + 1 < block_num {
            block_byte |= 0x08; // more blocks follow
        }
        buf.push(block_byte);
    }

    if !data.is_empty() {
        buf.push(0xFF);
        buf.extend_from_slice(data);
    }

    buf
}

/// GET `e/<name>` re-announcing a subscription with MyDevices scope encoded
/// as the `u` Uri-Query.
///
/// Returns `None` for an unfiltered Firehose subscription, which is
/// forbidden.
#[must_use]
pub fn subscription_scope(
    message_id: u16,
    event_name: &str,
    my_devices: bool,
) -> Option<Vec<u8>> {
    let mut buf = subscription_prelude(message_id, event_name);
    if my_devices {
        buf.push(0x41); // one-byte Uri-Query option
        buf.push(b'u');
    } else if event_name.is_empty() {
        return None;
    }
    Some(buf)
}

/// GET `e/<name>` subscribing to one publisher device; the device id rides
/// in the payload.
#[must_use]
pub fn subscription_device(message_id: u16, event_name: &str, device_id: &[u8]) -> Vec<u8> {
    let mut buf = subscription_prelude(message_id, event_name);
    if !device_id.is_empty() {
        buf.push(0xFF);
        buf.extend_from_slice(device_id);
    }
    buf
}

fn subscription_prelude(message_id: u16, event_name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + event_name.len());
    buf.push(0x40); // confirmable, no token
    buf.push(code::GET);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(0xB1);
    buf.push(b'e');
    let name = event_name.as_bytes();
    let name = &name[..name.len().min(MAX_EVENT_NAME_LEN)];
    event_name_uri_path(&mut buf, name);
    buf
}

/// Parsed inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub name: String,
    pub data: Vec<u8>,
    pub event_type: EventType,
}

/// Decode an inbound event: marker path, name segments, payload.
#[must_use]
pub fn decode_event(message: &Message) -> Option<InboundEvent> {
    let mut options = message.options();
    let (number, marker) = options.next()?;
    if number != super::option::URI_PATH || marker.len() != 1 {
        return None;
    }
    let event_type = match marker[0] {
        b'e' => EventType::Public,
        b'E' => EventType::Private,
        _ => return None,
    };

    let mut name = String::new();
    for (number, value) in options {
        if number != super::option::URI_PATH {
            continue;
        }
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&String::from_utf8_lossy(value));
    }
    if name.is_empty() {
        return None;
    }

    Some(InboundEvent {
        name,
        data: message.payload().to_vec(),
        event_type,
    })
}

// =======================================================================
// Firmware update messages
// =======================================================================

/// PUT `u` confirming the update is finished, with an optional result blob.
#[must_use]
pub fn update_done(message_id: u16, result: &[u8], confirmable: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7 + result.len());
    buf.push(if confirmable { 0x40 } else { 0x50 });
    buf.push(code::PUT);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(0xB1);
    buf.push(b'u');
    if !result.is_empty() {
        buf.push(0xFF);
        buf.extend_from_slice(result);
    }
    buf
}

/// 2.04 response to UpdateBegin, payload carrying the accepted flags byte.
#[must_use]
pub fn update_ready(message_id: u16, token: u8, flags: u8, confirmable: bool) -> Vec<u8> {
    separate_response(message_id, token, code::CHANGED, &[flags], confirmable)
}

/// Per-chunk response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReceivedCode {
    /// Chunk persisted.
    Ok,
    /// Chunk rejected; the broker resends.
    Bad,
}

impl ChunkReceivedCode {
    #[must_use]
    pub fn reply_code(self) -> u8 {
        match self {
            ChunkReceivedCode::Ok => code::CHANGED,
            ChunkReceivedCode::Bad => code::BAD_REQUEST,
        }
    }
}

/// Response to a firmware chunk.
#[must_use]
pub fn chunk_received(
    message_id: u16,
    token: u8,
    chunk_code: ChunkReceivedCode,
    confirmable: bool,
) -> Vec<u8> {
    separate_response(message_id, token, chunk_code.reply_code(), &[], confirmable)
}

/// GET `c` asking the broker to resend one missing chunk by index.
#[must_use]
pub fn chunk_missed(message_id: u16, chunk_index: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(0x40); // confirmable, no token
    buf.push(code::GET);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(0xB1);
    buf.push(b'c');
    buf.push(0xFF);
    buf.extend_from_slice(&chunk_index.to_be_bytes());
    buf
}

/// UpdateBegin payload: `flags(1) | chunk_size(2) | file_length(4) |
/// chunk_count(4) | target_address(4)`, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateBeginPayload {
    pub flags: u8,
    pub chunk_size: u16,
    pub file_length: u32,
    pub chunk_count: u32,
    pub target_address: u32,
}

impl UpdateBeginPayload {
    /// Decode from an UpdateBegin/SaveBegin payload.
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 15 {
            return None;
        }
        let chunk_size = u16::from_be_bytes([payload[1], payload[2]]);
        if chunk_size == 0 || usize::from(chunk_size) > MAX_BLOCK_SIZE {
            return None;
        }
        Some(Self {
            flags: payload[0],
            chunk_size,
            file_length: u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]),
            chunk_count: u32::from_be_bytes([payload[7], payload[8], payload[9], payload[10]]),
            target_address: u32::from_be_bytes([
                payload[11],
                payload[12],
                payload[13],
                payload[14],
            ]),
        })
    }

    /// Encode (used by tests and the broker simulator).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(15);
        buf.push(self.flags);
        buf.extend_from_slice(&self.chunk_size.to_be_bytes());
        buf.extend_from_slice(&self.file_length.to_be_bytes());
        buf.extend_from_slice(&self.chunk_count.to_be_bytes());
        buf.extend_from_slice(&self.target_address.to_be_bytes());
        buf
    }
}

/// Chunk payload: `chunk_index(2)` big-endian, then the chunk bytes.
#[must_use]
pub fn decode_chunk(payload: &[u8]) -> Option<(u16, &[u8])> {
    if payload.len() < 2 {
        return None;
    }
    let index = u16::from_be_bytes([payload[0], payload[1]]);
    Some((index, &payload[2..]))
}
