// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Reliability layer: the message store stacked on the DTLS channel.
//!
//! Sits between the encrypted channel and the protocol facade on both
//! directions: outbound confirmables get ids assigned and enter the
//! retransmission schedule; inbound frames are matched against the store
//! for ack routing and duplicate suppression before they reach the
//! dispatcher.

use super::store::{Disposition, MessageStore, TimeoutEvent};
use super::{ChannelCommand, CoapType, EstablishOutcome, Message, MessageChannel};
use crate::dtls::DtlsChannel;
use crate::protocol::{Platform, Result};
use crate::transport::Transport;

/// What the store learned about one received frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveInfo {
    /// The frame is an ACK/RESET that matched an outstanding confirmable.
    pub matched_reply: bool,
    /// The frame was a RESET; the session must be discarded after
    /// dispatch.
    pub reset: bool,
    /// Measured round trip of the matched exchange (ms).
    pub round_trip: Option<u64>,
}

/// Reliable CoAP channel over DTLS.
pub struct ReliableChannel<T: Transport> {
    channel: DtlsChannel<T>,
    store: MessageStore,
    next_message_id: u16,
    /// Loop time, refreshed by the facade each pass; timestamps the
    /// entries created by trait-level sends.
    now: u64,
}

impl<T: Transport> ReliableChannel<T> {
    /// Stack a fresh store on an encrypted channel.
    #[must_use]
    pub fn new(channel: DtlsChannel<T>, ack_timeout_ms: u32) -> Self {
        Self {
            channel,
            store: MessageStore::new(ack_timeout_ms),
            next_message_id: 1,
            now: 0,
        }
    }

    /// Refresh the loop time used to timestamp store entries.
    pub fn set_now(&mut self, now: u64) {
        self.now = now;
    }

    /// The wrapped DTLS channel.
    pub fn inner_mut(&mut self) -> &mut DtlsChannel<T> {
        &mut self.channel
    }

    /// Reset the channel state machine for a new establish cycle.
    pub fn init_status(&mut self) {
        self.channel.init_status();
    }

    /// Step session establishment; seeds the message-id counter from the
    /// RNG when a session comes up.
    pub fn establish(
        &mut self,
        flags: &mut u32,
        platform: &mut dyn Platform,
    ) -> Result<EstablishOutcome> {
        let outcome = self.channel.establish(flags, platform)?;
        if outcome != EstablishOutcome::InProgress {
            self.store.clear();
            // Fresh random id base per session; zero is reserved.
            let seed = (platform.random_u32() & 0xFFFF) as u16;
            self.next_message_id = seed.max(1);
            log::trace!("[coap] message id seeded at {:#06x}", self.next_message_id);
        }
        Ok(outcome)
    }

    /// Allocate the next message id.
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Receive one frame, running it through the store.
    pub fn receive(&mut self, msg: &mut Message, now: u64) -> Result<ReceiveInfo> {
        self.channel.receive(msg)?;
        if msg.is_empty() {
            return Ok(ReceiveInfo::default());
        }
        match self.store.receive(msg, now) {
            Disposition::Reply { reset, round_trip } => Ok(ReceiveInfo {
                matched_reply: true,
                reset,
                round_trip,
            }),
            Disposition::Consumed { reset } => Ok(ReceiveInfo {
                matched_reply: false,
                reset,
                round_trip: None,
            }),
            Disposition::CachedResend(bytes) => {
                // Replay the cached response without re-registering it.
                let mut cached = Message::from_bytes(bytes);
                cached.decode_id();
                self.channel.send(&mut cached)?;
                Ok(ReceiveInfo::default())
            }
            Disposition::PassThrough => Ok(ReceiveInfo::default()),
        }
    }

    /// Retransmit overdue confirmables; returns abandoned exchanges.
    pub fn tick(&mut self, now: u64) -> Result<Vec<TimeoutEvent>> {
        let tick = self.store.tick(now);
        for frame in tick.resend {
            let mut msg = Message::from_bytes(frame);
            msg.decode_id();
            self.channel.send(&mut msg)?;
        }
        for event in &tick.timeouts {
            if event.close_channel {
                log::warn!(
                    "[coap] exchange id={:#06x} dead with silent channel, closing",
                    event.id
                );
                self.channel.command(ChannelCommand::Close)?;
            } else {
                log::info!(
                    "[coap] exchange id={:#06x} dead but channel recently alive",
                    event.id
                );
            }
        }
        Ok(tick.timeouts)
    }

    /// Drop all store state; returns ids of in-flight confirmables.
    pub fn clear(&mut self) -> Vec<u16> {
        self.store.clear()
    }

    /// True while any confirmable awaits its ACK.
    #[must_use]
    pub fn has_unacknowledged_requests(&self) -> bool {
        self.store.has_unacknowledged_requests()
    }
}

impl<T: Transport> MessageChannel for ReliableChannel<T> {
    fn send(&mut self, msg: &mut Message) -> Result<()> {
        if !msg.has_id() {
            match msg.coap_type() {
                Some(CoapType::Confirmable | CoapType::NonConfirmable) => {
                    let id = self.next_message_id();
                    msg.set_id(id);
                }
                _ => msg.decode_id(),
            }
        }
        // Track before transmitting so a duplicate reply arriving
        // immediately still matches.
        self.store.send(msg, self.now)?;
        self.channel.send(msg)
    }

    fn command(&mut self, cmd: ChannelCommand) -> Result<()> {
        self.channel.command(cmd)
    }
}
