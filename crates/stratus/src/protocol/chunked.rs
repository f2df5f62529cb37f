// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Firmware-update receive engine.
//!
//! Driven by three broker messages: UpdateBegin/SaveBegin announces the
//! file and chunk geometry, Chunk delivers one indexed piece (out of order
//! is fine), UpdateDone closes the transfer. Chunk persistence is the
//! host's business through [`FirmwareSink`]; any negative return aborts the
//! transfer with a coded response.
//!
//! When UpdateDone arrives with chunks still missing, the engine answers
//! `4.00` and asks for each missing index with a GET to `/c`, letting the
//! broker resend and retry the close.

use super::UpdateFlags;
use crate::coap::codec::{self, ChunkReceivedCode, UpdateBeginPayload};
use crate::coap::{code, Message, MessageChannel};
use crate::protocol::Result;

/// Geometry of the announced transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkDescriptor {
    pub chunk_count: u32,
    pub chunk_size: u16,
    pub file_length: u32,
    pub target_address: u32,
}

/// Host-side firmware persistence.
///
/// All methods return a non-negative value on success; a negative value
/// aborts the transfer. Chunk bytes are borrowed for the call only.
pub trait FirmwareSink {
    /// A transfer is about to start; allocate/erase the target area.
    fn prepare(&mut self, descriptor: &ChunkDescriptor, flags: u32) -> i32;

    /// Persist one chunk at its index.
    fn save_chunk(&mut self, descriptor: &ChunkDescriptor, index: u32, chunk: &[u8]) -> i32;

    /// The transfer is complete; validate and stage the image.
    fn finish(&mut self, flags: u32) -> i32;
}

/// What the facade must do after an UpdateDone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to do (transfer still running or aborted).
    None,
    /// Transfer finished; reboot unless the broker said not to.
    Finished { reboot: bool },
}

#[derive(Debug, PartialEq, Eq)]
enum TransferState {
    Idle,
    InProgress,
}

/// The chunked-transfer state machine.
pub struct ChunkedTransfer {
    state: TransferState,
    descriptor: ChunkDescriptor,
    flags: UpdateFlags,
    received: Vec<bool>,
    received_count: u32,
}

impl ChunkedTransfer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TransferState::Idle,
            descriptor: ChunkDescriptor::default(),
            flags: UpdateFlags::default(),
            received: Vec::new(),
            received_count: 0,
        }
    }

    /// True while a transfer is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransferState::InProgress
    }

    /// Abandon any running transfer (session failure).
    pub fn cancel(&mut self) {
        if self.state == TransferState::InProgress {
            log::warn!("[ota] transfer cancelled");
        }
        self.state = TransferState::Idle;
        self.received.clear();
        self.received_count = 0;
    }

    /// Handle UpdateBegin/SaveBegin.
    ///
    /// A disabled, non-forced update is refused with `4.03` and no state
    /// transition.
    pub fn handle_update_begin(
        &mut self,
        message: &Message,
        token: u8,
        message_id: u16,
        updates_enabled: bool,
        sink: &mut dyn FirmwareSink,
        channel: &mut dyn MessageChannel,
    ) -> Result<()> {
        let Some(payload) = UpdateBeginPayload::decode(message.payload()) else {
            log::warn!("[ota] malformed update begin");
            return respond(channel, codec::coded_ack_token(token, code::BAD_REQUEST, message_id), message_id);
        };

        let flags = UpdateFlags(u32::from(payload.flags));
        if !updates_enabled && !flags.contains(UpdateFlags::FORCED) {
            log::info!("[ota] updates disabled, refusing transfer");
            return respond(channel, codec::coded_ack_token(token, code::FORBIDDEN, message_id), message_id);
        }

        let chunk_count = if payload.chunk_count != 0 {
            payload.chunk_count
        } else {
            (payload.file_length + u32::from(payload.chunk_size) - 1)
                / u32::from(payload.chunk_size)
        };
        let descriptor = ChunkDescriptor {
            chunk_count,
            chunk_size: payload.chunk_size,
            file_length: payload.file_length,
            target_address: payload.target_address,
        };

        if sink.prepare(&descriptor, flags.0) < 0 {
            log::error!("[ota] host refused transfer preparation");
            return respond(
                channel,
                codec::coded_ack_token(token, code::INTERNAL_SERVER_ERROR, message_id),
                message_id,
            );
        }

        log::info!(
            "[ota] transfer started: {} bytes, {} chunks of {}",
            descriptor.file_length,
            descriptor.chunk_count,
            descriptor.chunk_size
        );
        self.state = TransferState::InProgress;
        self.descriptor = descriptor;
        self.flags = flags;
        self.received = vec![false; chunk_count as usize];
        self.received_count = 0;

        respond(
            channel,
            codec::update_ready(message_id, token, payload.flags, false),
            message_id,
        )
    }

    /// Handle one Chunk message.
    pub fn handle_chunk(
        &mut self,
        message: &Message,
        token: u8,
        message_id: u16,
        sink: &mut dyn FirmwareSink,
        channel: &mut dyn MessageChannel,
    ) -> Result<()> {
        if self.state != TransferState::InProgress {
            return respond(
                channel,
                codec::chunk_received(message_id, token, ChunkReceivedCode::Bad, false),
                message_id,
            );
        }
        let Some((index, data)) = codec::decode_chunk(message.payload()) else {
            return respond(
                channel,
                codec::chunk_received(message_id, token, ChunkReceivedCode::Bad, false),
                message_id,
            );
        };
        let index = u32::from(index);
        if index >= self.descriptor.chunk_count
            || sink.save_chunk(&self.descriptor, index, data) < 0
        {
            log::warn!("[ota] chunk {} rejected", index);
            return respond(
                channel,
                codec::chunk_received(message_id, token, ChunkReceivedCode::Bad, false),
                message_id,
            );
        }

        let slot = &mut self.received[index as usize];
        if !*slot {
            *slot = true;
            self.received_count += 1;
        }
        log::trace!(
            "[ota] chunk {}/{} stored",
            self.received_count,
            self.descriptor.chunk_count
        );
        respond(
            channel,
            codec::chunk_received(message_id, token, ChunkReceivedCode::Ok, false),
            message_id,
        )
    }

    /// Handle UpdateDone; may finish the transfer or request missing
    /// chunks.
    pub fn handle_update_done(
        &mut self,
        token: u8,
        message_id: u16,
        sink: &mut dyn FirmwareSink,
        channel: &mut dyn MessageChannel,
    ) -> Result<UpdateOutcome> {
        if self.state != TransferState::InProgress {
            respond(channel, codec::coded_ack_token(token, code::BAD_REQUEST, message_id), message_id)?;
            return Ok(UpdateOutcome::None);
        }

        let missing: Vec<u32> = self
            .received
            .iter()
            .enumerate()
            .filter(|(_, got)| !**got)
            .map(|(i, _)| i as u32)
            .collect();
        if !missing.is_empty() {
            log::info!("[ota] {} chunks missing, requesting resend", missing.len());
            respond(channel, codec::coded_ack_token(token, code::BAD_REQUEST, message_id), message_id)?;
            for index in missing {
                let mut request = Message::from_bytes(codec::chunk_missed(0, index as u16));
                channel.send(&mut request)?;
            }
            return Ok(UpdateOutcome::None);
        }

        if sink.finish(self.flags.0) < 0 {
            log::error!("[ota] host failed to finish transfer");
            respond(
                channel,
                codec::coded_ack_token(token, code::INTERNAL_SERVER_ERROR, message_id),
                message_id,
            )?;
            self.cancel();
            return Ok(UpdateOutcome::None);
        }

        respond(channel, codec::coded_ack_token(token, code::CHANGED, message_id), message_id)?;
        let reboot = !self.flags.contains(UpdateFlags::DONT_RESET);
        log::info!("[ota] transfer complete, reboot={}", reboot);
        self.state = TransferState::Idle;
        self.received.clear();
        self.received_count = 0;
        Ok(UpdateOutcome::Finished { reboot })
    }
}

impl Default for ChunkedTransfer {
    fn default() -> Self {
        Self::new()
    }
}

fn respond(channel: &mut dyn MessageChannel, bytes: Vec<u8>, message_id: u16) -> Result<()> {
    let mut response = Message::from_bytes(bytes);
    response.set_id(message_id);
    channel.send(&mut response)
}
