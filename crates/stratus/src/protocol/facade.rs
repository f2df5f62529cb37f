// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! The protocol facade: owns the channel, the codec dispatch, and every
//! feature registry; drives one loop pass at a time.
//!
//! One [`Protocol::event_loop`] pass:
//!
//! 1. age the completion registry by the elapsed tick;
//! 2. receive one datagram, decode, dispatch;
//! 3. retransmit timed-out confirmables;
//! 4. let the pinger decide whether a keepalive is due.
//!
//! Session bring-up is a separate state machine ([`Protocol::begin`]):
//! establish the channel, send Hello, wait for its ACK, post the describe.
//! A resumed session skips the Hello and pings instead.

use std::cell::Cell;
use std::rc::Rc;

use super::ack::{CompletionHandler, CompletionRegistry};
use super::chunked::{ChunkedTransfer, FirmwareSink, UpdateOutcome};
use super::diagnostics::{DiagnosticCloud, DiagnosticRegistry};
use super::functions::FunctionRegistry;
use super::ping::Pinger;
use super::publisher::{BlockReply, Publisher};
use super::subscriptions::{EventScope, SubscriptionTable};
use super::timesync::TimeSync;
use super::variables::VariableRegistry;
use super::{Error, EventFlags, EventType, Platform, Result};
use crate::coap::codec::{self, CoapMessageType};
use crate::coap::{
    code, completion_error, ChannelCommand, CoapType, EstablishOutcome, Message, MessageChannel,
    ReliableChannel, SKIP_SESSION_RESUME_HELLO,
};
use crate::config::{
    ConnectionProperties, DEVICE_ID_LEN, HELLO_ACK_TIMEOUT_MS, MAX_BLOCK_SIZE,
    SEND_EVENT_ACK_TIMEOUT_MS,
};
use crate::transport::Transport;

/// Describe selector: system half of the document.
pub const DESCRIBE_SYSTEM: u8 = 1 << 0;
/// Describe selector: application half (functions and variables).
pub const DESCRIBE_APPLICATION: u8 = 1 << 1;
/// Describe selector: binary diagnostics payload, requested in isolation.
pub const DESCRIBE_METRICS: u8 = 1 << 2;
/// Default describe: system plus application.
pub const DESCRIBE_DEFAULT: u8 = DESCRIBE_SYSTEM | DESCRIBE_APPLICATION;
/// Highest valid selector value.
pub const DESCRIBE_MAX: u8 = DESCRIBE_SYSTEM | DESCRIBE_APPLICATION | DESCRIBE_METRICS;

/// Hello capability flags.
pub const HELLO_FLAG_OTA_UPGRADE_SUCCESSFUL: u8 = 0x01;
pub const HELLO_FLAG_DIAGNOSTICS_SUPPORT: u8 = 0x02;
pub const HELLO_FLAG_IMMEDIATE_UPDATES_SUPPORT: u8 = 0x04;
pub const HELLO_FLAG_GOODBYE_SUPPORT: u8 = 0x10;
pub const HELLO_FLAG_DEVICE_INITIATED_DESCRIBE: u8 = 0x20;
pub const HELLO_FLAG_COMPRESSED_OTA: u8 = 0x40;
pub const HELLO_FLAG_OTA_PROTOCOL_V3: u8 = 0x80;

/// Host callbacks the facade borrows; all optional.
#[derive(Default)]
pub struct HostCallbacks {
    /// Cloud-initiated signal (identify LED etc.), on/off.
    pub signal: Option<Box<dyn FnMut(bool)>>,
    /// Broker time arrived (UNIX seconds).
    pub set_time: Option<Box<dyn FnMut(u32)>>,
    /// Reboot command, with its argument string.
    pub reboot: Option<Box<dyn FnMut(&str)>>,
    /// A publish was attempted: (name, data, accepted).
    pub send_publish: Option<Box<dyn FnMut(&str, &[u8], bool)>>,
    /// Property update request: (key, arg, caller is owner) -> i32 result.
    pub property_update: Option<Box<dyn FnMut(&str, &str, bool) -> i32>>,
    /// Extra system info appended to the describe document: a JSON
    /// fragment of `"key":value` pairs without surrounding braces.
    pub system_info: Option<Box<dyn FnMut() -> String>>,
    /// Used-memory sampler feeding the periodic diagnostics refresh.
    pub used_memory: Option<Box<dyn FnMut() -> u32>>,
}

/// Firmware sink that refuses every transfer (no OTA support wired).
struct NullFirmwareSink;

impl FirmwareSink for NullFirmwareSink {
    fn prepare(&mut self, _descriptor: &super::chunked::ChunkDescriptor, _flags: u32) -> i32 {
        -1
    }
    fn save_chunk(
        &mut self,
        _descriptor: &super::chunked::ChunkDescriptor,
        _index: u32,
        _chunk: &[u8],
    ) -> i32 {
        -1
    }
    fn finish(&mut self, _flags: u32) -> i32 {
        -1
    }
}

/// Session bring-up progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Keep calling `begin` on later loop passes.
    InProgress,
    /// The session is up.
    Established { resumed: bool },
}

/// Bring-up state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    ChannelInit,
    ChannelEstablished,
    SendHello,
    AckWaiting,
}

/// The protocol facade.
pub struct Protocol<T: Transport> {
    channel: ReliableChannel<T>,
    platform: Box<dyn Platform>,
    callbacks: HostCallbacks,
    firmware: Box<dyn FirmwareSink>,

    pub(crate) functions: FunctionRegistry,
    pub(crate) variables: VariableRegistry,
    pub(crate) subscriptions: SubscriptionTable,
    publisher: Publisher,
    chunked: ChunkedTransfer,
    ack_handlers: CompletionRegistry,
    pinger: Pinger,
    timesync: TimeSync,
    pub(crate) diagnostics: DiagnosticRegistry,

    device_id: [u8; DEVICE_ID_LEN],
    product_id: u16,
    firmware_version: u16,
    platform_id: u16,
    owners: Vec<String>,

    status: ProtocolStatus,
    hello_acked: Rc<Cell<bool>>,
    hello_wait_since: u64,
    last_message_millis: u64,
    last_ack_handlers_update: u64,
    next_token: u8,
    was_ota_upgrade_successful: bool,
    updates_enabled: bool,
}

impl<T: Transport> Protocol<T> {
    /// Assemble the facade around an established channel stack.
    pub fn new(
        channel: ReliableChannel<T>,
        platform: Box<dyn Platform>,
        callbacks: HostCallbacks,
        device_id: [u8; DEVICE_ID_LEN],
        platform_id: u16,
        properties: &ConnectionProperties,
    ) -> Self {
        let mut pinger = Pinger::new();
        pinger.init(u64::from(properties.ping_interval_ms));
        Self {
            channel,
            platform,
            callbacks,
            firmware: Box::new(NullFirmwareSink),
            functions: FunctionRegistry::new(),
            variables: VariableRegistry::new(),
            subscriptions: SubscriptionTable::new(),
            publisher: Publisher::new(),
            chunked: ChunkedTransfer::new(),
            ack_handlers: CompletionRegistry::new(),
            pinger,
            timesync: TimeSync::new(),
            diagnostics: DiagnosticRegistry::new(),
            device_id,
            product_id: 0,
            firmware_version: 0,
            platform_id,
            owners: Vec::new(),
            status: ProtocolStatus::ChannelInit,
            hello_acked: Rc::new(Cell::new(false)),
            hello_wait_since: 0,
            last_message_millis: 0,
            last_ack_handlers_update: 0,
            next_token: 0,
            was_ota_upgrade_successful: false,
            updates_enabled: true,
        }
    }

    /// Install the host's firmware sink, enabling OTA transfers.
    pub fn set_firmware_sink(&mut self, sink: Box<dyn FirmwareSink>) {
        self.firmware = sink;
    }

    pub fn set_product_id(&mut self, product_id: u16) {
        self.product_id = product_id;
    }

    pub fn set_firmware_version(&mut self, version: u16) {
        self.firmware_version = version;
    }

    pub fn set_ota_upgrade_successful(&mut self, successful: bool) {
        self.was_ota_upgrade_successful = successful;
    }

    /// Replace the owner list (driven by the system owners event).
    pub fn set_owners(&mut self, owners: Vec<String>) {
        self.owners = owners;
    }

    /// Allow or refuse non-forced firmware transfers.
    pub fn set_updates_enabled(&mut self, enabled: bool) {
        self.updates_enabled = enabled;
    }

    /// The keepalive scheduler (interval overrides).
    pub fn pinger_mut(&mut self) -> &mut Pinger {
        &mut self.pinger
    }

    /// The wrapped channel, for the supervisor's transport access.
    pub fn channel_mut(&mut self) -> &mut ReliableChannel<T> {
        &mut self.channel
    }

    /// Monotonic now, for supervisor timers.
    pub fn now(&mut self) -> u64 {
        self.platform.millis()
    }

    /// Bring-up state, for supervisor status mapping.
    #[must_use]
    pub fn bring_up_status(&self) -> ProtocolStatus {
        self.status
    }

    /// Invoke the host reboot callback (system reset event, OTA finish).
    pub fn invoke_reboot(&mut self, arg: &str) {
        if let Some(reboot) = self.callbacks.reboot.as_mut() {
            reboot(arg);
        } else {
            log::info!("[protocol] reboot requested but no reboot callback set");
        }
    }

    /// Announce a single subscription to the broker.
    pub fn announce_subscription(
        &mut self,
        filter: &str,
        scope: EventScope,
        device_id: Option<[u8; DEVICE_ID_LEN]>,
    ) -> Result<()> {
        let frame = match device_id {
            Some(device_id) => codec::subscription_device(0, filter, &device_id),
            None => codec::subscription_scope(0, filter, scope == EventScope::MyDevices)
                .ok_or(Error::Protocol)?,
        };
        let mut message = Message::from_bytes(frame);
        self.channel.send(&mut message)
    }

    /// Random word from the host RNG.
    pub fn random(&mut self) -> u32 {
        self.platform.random_u32()
    }

    fn next_token(&mut self) -> u8 {
        self.next_token = self.next_token.wrapping_add(1);
        if self.next_token == 0 {
            self.next_token = 1;
        }
        self.next_token
    }

    // ===================================================================
    // Session bring-up
    // ===================================================================

    /// Step the bring-up state machine once.
    pub fn begin(&mut self) -> Result<BeginOutcome> {
        match self.status {
            ProtocolStatus::ChannelInit => {
                log::info!("[protocol] establishing secure connection");
                self.chunked.cancel();
                self.timesync.reset();
                self.publisher.cancel_all();
                self.ack_handlers.clear(Error::Cancelled);
                self.last_ack_handlers_update = self.platform.millis();
                self.hello_acked.set(false);
                self.channel.init_status();
                self.status = ProtocolStatus::ChannelEstablished;
                Ok(BeginOutcome::InProgress)
            }
            ProtocolStatus::ChannelEstablished => {
                let mut channel_flags = 0u32;
                match self.channel.establish(&mut channel_flags, self.platform.as_mut()) {
                    Ok(EstablishOutcome::InProgress) => Ok(BeginOutcome::InProgress),
                    Ok(EstablishOutcome::SessionConnected) => {
                        self.status = ProtocolStatus::SendHello;
                        Ok(BeginOutcome::InProgress)
                    }
                    Ok(EstablishOutcome::SessionResumed) => {
                        // Unconditionally flag the session as moving on
                        // resumption: the broker must re-learn our 5-tuple.
                        self.channel.command(ChannelCommand::MoveSession)?;
                        if channel_flags & SKIP_SESSION_RESUME_HELLO != 0 {
                            log::info!("[protocol] session resumed, skipping hello");
                            self.ping()?;
                            self.status = ProtocolStatus::ChannelInit;
                            return Ok(BeginOutcome::Established { resumed: true });
                        }
                        self.status = ProtocolStatus::SendHello;
                        Ok(BeginOutcome::InProgress)
                    }
                    Err(err) => {
                        log::error!("[protocol] handshake failed: {}", err);
                        self.status = ProtocolStatus::ChannelInit;
                        Err(err)
                    }
                }
            }
            ProtocolStatus::SendHello => {
                log::info!("[protocol] sending hello");
                match self.send_hello() {
                    Ok(()) => {
                        self.hello_wait_since = self.platform.millis();
                        self.status = ProtocolStatus::AckWaiting;
                        Ok(BeginOutcome::InProgress)
                    }
                    Err(err) => {
                        log::error!("[protocol] could not send hello: {}", err);
                        self.status = ProtocolStatus::ChannelInit;
                        Err(err)
                    }
                }
            }
            ProtocolStatus::AckWaiting => {
                let now = self.platform.millis();
                if now.saturating_sub(self.hello_wait_since) >= u64::from(HELLO_ACK_TIMEOUT_MS) {
                    log::error!("[protocol] hello unacknowledged");
                    self.status = ProtocolStatus::ChannelInit;
                    return Err(Error::Timeout);
                }
                self.event_loop()?;
                if self.hello_acked.get() {
                    log::info!("[protocol] handshake completed");
                    self.post_description(DESCRIBE_DEFAULT)?;
                    self.status = ProtocolStatus::ChannelInit;
                    return Ok(BeginOutcome::Established { resumed: false });
                }
                Ok(BeginOutcome::InProgress)
            }
        }
    }

    fn send_hello(&mut self) -> Result<()> {
        let mut flags = HELLO_FLAG_DIAGNOSTICS_SUPPORT
            | HELLO_FLAG_IMMEDIATE_UPDATES_SUPPORT
            | HELLO_FLAG_OTA_PROTOCOL_V3;
        if self.was_ota_upgrade_successful {
            flags |= HELLO_FLAG_OTA_UPGRADE_SUCCESSFUL;
        }
        let mut message = Message::from_bytes(codec::hello(
            0,
            flags,
            self.platform_id,
            self.product_id,
            self.firmware_version,
            true,
            &self.device_id,
        ));
        message.set_confirm_received(true);
        self.last_message_millis = self.platform.millis();
        self.channel.set_now(self.last_message_millis);
        self.channel.send(&mut message)?;

        let hello_id = message.id().ok_or(Error::MissingMessageId)?;
        let acked = Rc::clone(&self.hello_acked);
        self.ack_handlers.add(
            hello_id,
            HELLO_ACK_TIMEOUT_MS,
            Box::new(move |outcome| {
                if outcome.is_ok() {
                    acked.set(true);
                }
            }),
        );
        Ok(())
    }

    // ===================================================================
    // The driving loop
    // ===================================================================

    /// One loop pass; returns the type of the message processed, if any.
    pub fn event_loop(&mut self) -> Result<CoapMessageType> {
        let now = self.platform.millis();
        let elapsed = now.saturating_sub(self.last_ack_handlers_update);
        self.ack_handlers.update(elapsed);
        self.last_ack_handlers_update = now;
        self.channel.set_now(now);

        let mut message = Message::new();
        let info = self.channel.receive(&mut message, now)?;
        if let Some(round_trip) = info.round_trip {
            self.diagnostics
                .cloud(DiagnosticCloud::CoapRoundTrip, round_trip as f64);
        }

        let mut message_type = CoapMessageType::None;
        if !message.is_empty() {
            message_type = self.handle_received_message(&mut message, now)?;
        }
        if info.reset {
            // A RESET invalidates the whole session.
            log::warn!("[protocol] reset received, discarding session");
            self.chunked.cancel();
            return match self.channel.command(ChannelCommand::DiscardSession) {
                Err(err) => Err(err),
                Ok(()) => Err(Error::SessionDiscarded),
            };
        }

        // Retransmissions and abandoned exchanges.
        let timeouts = self.channel.tick(now)?;
        for event in timeouts {
            self.diagnostics
                .cloud(DiagnosticCloud::UnacknowledgedMessages, 1.0);
            if let Some(BlockReply::Done {
                completion,
                outcome,
                ..
            }) = self.publisher.handle_timeout(event.id)
            {
                if let Some(completion) = completion {
                    completion(outcome);
                }
            }
            self.ack_handlers.set_error(event.id, Error::Timeout);
        }

        // Keepalive.
        if self
            .pinger
            .should_ping(now.saturating_sub(self.last_message_millis))
        {
            log::debug!("[protocol] keepalive ping");
            self.ping()?;
        }

        Ok(message_type)
    }

    fn handle_received_message(
        &mut self,
        message: &mut Message,
        now: u64,
    ) -> Result<CoapMessageType> {
        self.last_message_millis = now;
        let message_type = codec::decode_type(message.bytes());
        let token = message.token();
        let message_id = message.wire_id();
        let reply_code = message.code();
        let coap_type = message.coap_type();

        if coap_type.is_some_and(CoapType::is_reply) {
            // RESET arrives with an empty code; treat as a server error for
            // completion routing.
            let effective = if coap_type == Some(CoapType::Reset) {
                code::INTERNAL_SERVER_ERROR
            } else {
                reply_code
            };
            self.notify_message_complete(message_id, effective)?;
        }

        match message_type {
            CoapMessageType::Describe => {
                let desc_flags = describe_flags(message);
                self.send_description(token, message_id, desc_flags)?;
            }
            CoapMessageType::FunctionCall => {
                let owners = &self.owners;
                self.functions.handle_call(
                    message,
                    token,
                    message_id,
                    |caller| caller.is_some_and(|c| owners.iter().any(|o| o == c)),
                    &mut self.channel,
                )?;
            }
            CoapMessageType::VariableRequest => {
                self.variables
                    .handle_request(message, token, message_id, &mut self.channel)?;
            }
            CoapMessageType::SaveBegin | CoapMessageType::UpdateBegin => {
                self.chunked.handle_update_begin(
                    message,
                    token,
                    message_id,
                    self.updates_enabled,
                    self.firmware.as_mut(),
                    &mut self.channel,
                )?;
            }
            CoapMessageType::Chunk => {
                self.chunked.handle_chunk(
                    message,
                    token,
                    message_id,
                    self.firmware.as_mut(),
                    &mut self.channel,
                )?;
            }
            CoapMessageType::UpdateDone => {
                let outcome = self.chunked.handle_update_done(
                    token,
                    message_id,
                    self.firmware.as_mut(),
                    &mut self.channel,
                )?;
                if let UpdateOutcome::Finished { reboot: true } = outcome {
                    if let Some(reboot) = self.callbacks.reboot.as_mut() {
                        reboot("firmware-update");
                    }
                }
            }
            CoapMessageType::Event => {
                if let Some(event) = codec::decode_event(message) {
                    self.subscriptions.deliver(&event);
                } else {
                    log::debug!("[protocol] undecodable event dropped");
                }
            }
            CoapMessageType::KeyChange => {
                self.handle_key_change(message, message_id)?;
            }
            CoapMessageType::UpdateProperty => {
                self.handle_property(message, token, message_id)?;
            }
            CoapMessageType::SignalStart | CoapMessageType::SignalStop => {
                let on = message_type == CoapMessageType::SignalStart;
                let mut response =
                    Message::from_bytes(codec::coded_ack_token(token, code::CHANGED, message_id));
                response.set_id(message_id);
                self.channel.send(&mut response)?;
                if let Some(signal) = self.callbacks.signal.as_mut() {
                    signal(on);
                }
            }
            CoapMessageType::Hello => {
                if coap_type == Some(CoapType::Confirmable) {
                    let mut ack = Message::from_bytes(codec::empty_ack(message_id));
                    ack.set_id(message_id);
                    self.channel.send(&mut ack)?;
                }
            }
            CoapMessageType::Time => {
                if let Some(time) = codec::decode_time_response(message.bytes()) {
                    let time = self.timesync.handle_response(time, now);
                    if let Some(set_time) = self.callbacks.set_time.as_mut() {
                        set_time(time);
                    }
                }
            }
            CoapMessageType::Ping => {
                let mut ack = Message::from_bytes(codec::empty_ack(message_id));
                ack.set_id(message_id);
                self.channel.send(&mut ack)?;
            }
            CoapMessageType::EmptyAck | CoapMessageType::None => {}
            CoapMessageType::Error => {
                // Undecodable datagram: drop it on the floor.
                log::debug!("[protocol] dropping undecodable message");
            }
        }

        Ok(message_type)
    }

    fn notify_message_complete(&mut self, message_id: u16, reply_code: u8) -> Result<()> {
        log::trace!(
            "[protocol] message id={:#06x} complete with code {}.{:02}",
            message_id,
            code::class(reply_code),
            code::detail(reply_code)
        );

        // Block-wise continuation first.
        match self.publisher.handle_reply(message_id, reply_code) {
            Some(BlockReply::Continue { token, message }) => {
                self.ack_handlers.set_result(message_id);
                let mut message = message;
                self.channel.send(&mut message)?;
                if let Some(id) = message.id() {
                    self.publisher.note_block_sent(token, id);
                }
                return Ok(());
            }
            Some(BlockReply::Done {
                completion,
                outcome,
                ..
            }) => {
                self.ack_handlers.set_result(message_id);
                if let Some(completion) = completion {
                    completion(outcome);
                }
                return Ok(());
            }
            None => {}
        }

        match completion_error(reply_code) {
            None => self.ack_handlers.set_result(message_id),
            Some(err) => self.ack_handlers.set_error(message_id, err),
        }
        Ok(())
    }

    fn handle_key_change(&mut self, message: &Message, message_id: u16) -> Result<()> {
        if message.coap_type() == Some(CoapType::Confirmable) {
            let mut ack = Message::from_bytes(codec::empty_ack(message_id));
            ack.set_id(message_id);
            self.channel.send(&mut ack)?;
        }
        // A parameter byte of 1 demands a fresh session under the new key.
        if message.payload().first() == Some(&1) {
            log::info!("[protocol] key change demands session discard");
            return self.channel.command(ChannelCommand::DiscardSession);
        }
        Ok(())
    }

    fn handle_property(&mut self, message: &Message, token: u8, message_id: u16) -> Result<()> {
        let request = match super::functions::decode_call(message) {
            Ok(request) => request,
            Err(Error::Protocol) => {
                let mut response =
                    Message::from_bytes(codec::coded_ack_token(token, code::BAD_REQUEST, message_id));
                response.set_id(message_id);
                return self.channel.send(&mut response);
            }
            Err(other) => return Err(other),
        };
        let is_owner = request
            .caller_id
            .as_deref()
            .is_some_and(|c| self.owners.iter().any(|o| o == c));

        let Some(handler) = self.callbacks.property_update.as_mut() else {
            let mut response = Message::from_bytes(codec::coded_ack_token(
                token,
                code::INTERNAL_SERVER_ERROR,
                message_id,
            ));
            response.set_id(message_id);
            return self.channel.send(&mut response);
        };
        let result = handler(&request.key, &request.arg, is_owner);
        let mut response = Message::from_bytes(codec::function_return(message_id, token, result));
        response.set_id(message_id);
        self.channel.send(&mut response)
    }

    // ===================================================================
    // Outbound operations
    // ===================================================================

    /// Publish one event.
    ///
    /// Payloads beyond one block start a block-wise transaction. With
    /// [`EventFlags::WITH_ACK`] the completion fires on the final ACK;
    /// without, it fires immediately after the send.
    pub fn send_event(
        &mut self,
        event_name: &str,
        data: &[u8],
        ttl: u32,
        event_type: EventType,
        flags: EventFlags,
        completion: Option<CompletionHandler>,
    ) -> Result<()> {
        let now = self.platform.millis();
        self.channel.set_now(now);
        if self.publisher.is_rate_limited(event_name, now) {
            self.diagnostics
                .cloud(DiagnosticCloud::RateLimitedEvents, 1.0);
            return Err(Error::BandwidthExceeded);
        }

        if data.len() > MAX_BLOCK_SIZE {
            let token = self.next_token();
            let mut first =
                self.publisher
                    .begin_blockwise(event_name, data, ttl, event_type, token, completion)?;
            self.channel.send(&mut first)?;
            if let Some(id) = first.id() {
                self.publisher.note_block_sent(token, id);
            }
            return Ok(());
        }

        let token = if flags.with_ack { self.next_token() } else { 0 };
        let mut message = Message::from_bytes(codec::event(
            0,
            token,
            event_name,
            data,
            ttl,
            0,
            1,
            event_type,
            flags.with_ack,
        ));
        self.channel.send(&mut message)?;
        match completion {
            Some(completion) if flags.with_ack => {
                let id = message.id().ok_or(Error::MissingMessageId)?;
                self.ack_handlers
                    .add(id, SEND_EVENT_ACK_TIMEOUT_MS, completion);
            }
            Some(completion) => completion(Ok(())),
            None => {}
        }
        Ok(())
    }

    /// Notify the host's publish observer.
    pub fn notify_send_publish(&mut self, event_name: &str, data: &[u8], accepted: bool) {
        if let Some(observer) = self.callbacks.send_publish.as_mut() {
            observer(event_name, data, accepted);
        }
    }

    /// Sample the host's used-memory figure, if a sampler is wired.
    pub fn sample_used_memory(&mut self) -> Option<u32> {
        self.callbacks.used_memory.as_mut().map(|sampler| sampler())
    }

    /// Re-announce every subscription to the broker.
    pub fn send_subscriptions(&mut self) -> Result<()> {
        let announcements = self.subscriptions.announcements();
        log::debug!("[protocol] announcing {} subscriptions", announcements.len());
        for announcement in announcements {
            let frame = match announcement.device_id {
                Some(device_id) => {
                    codec::subscription_device(0, &announcement.filter, &device_id)
                }
                None => codec::subscription_scope(
                    0,
                    &announcement.filter,
                    announcement.scope == EventScope::MyDevices,
                )
                .ok_or(Error::Protocol)?,
            };
            let mut message = Message::from_bytes(frame);
            self.channel.send(&mut message)?;
        }
        Ok(())
    }

    /// Request the broker time; duplicates while pending are suppressed.
    pub fn send_time_request(&mut self) -> Result<()> {
        let now = self.platform.millis();
        if !self.timesync.begin_request(now) {
            return Ok(());
        }
        let token = self.next_token();
        let mut message = Message::from_bytes(codec::time_request(0, token));
        self.channel.set_now(now);
        self.channel.send(&mut message)
    }

    /// Send an empty CON ping immediately.
    pub fn ping(&mut self) -> Result<()> {
        let now = self.platform.millis();
        self.channel.set_now(now);
        let mut message = Message::from_bytes(codec::ping(0));
        self.channel.send(&mut message)?;
        self.last_message_millis = now;
        Ok(())
    }

    /// Post a device-initiated describe.
    pub fn post_description(&mut self, desc_flags: u8) -> Result<()> {
        let mut bytes = codec::describe_post_header(0, desc_flags);
        self.build_describe_message(&mut bytes, desc_flags);
        let mut message = Message::from_bytes(bytes);
        log::info!(
            "[protocol] posting '{}{}{}' describe",
            if desc_flags & DESCRIBE_SYSTEM != 0 { "S" } else { "" },
            if desc_flags & DESCRIBE_APPLICATION != 0 { "A" } else { "" },
            if desc_flags & DESCRIBE_METRICS != 0 { "M" } else { "" },
        );
        self.channel.send(&mut message)
    }

    /// Answer a broker describe request (piggybacked).
    fn send_description(&mut self, token: u8, message_id: u16, desc_flags: u8) -> Result<()> {
        let mut bytes = codec::content(message_id, token);
        self.build_describe_message(&mut bytes, desc_flags);
        let mut message = Message::from_bytes(bytes);
        message.set_id(message_id);
        self.channel.send(&mut message)
    }

    /// Render the describe document after the payload marker.
    fn build_describe_message(&mut self, out: &mut Vec<u8>, desc_flags: u8) {
        // Diagnostics are requested in isolation as a binary packet.
        if desc_flags == DESCRIBE_METRICS {
            out.push(0); // null byte means binary data
            out.push(DESCRIBE_METRICS);
            out.push(0);
            self.diagnostics.append_metrics(out);
            return;
        }

        out.push(b'{');
        let mut has_content = false;
        if desc_flags & DESCRIBE_APPLICATION != 0 {
            has_content = true;
            out.extend_from_slice(b"\"f\":[");
            for (i, key) in self.functions.describe_entries().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.push(b'"');
                out.extend_from_slice(key.as_bytes());
                out.push(b'"');
            }
            out.extend_from_slice(b"],\"v\":{");
            for (i, (key, type_digit)) in self.variables.describe_entries().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.push(b'"');
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b"\":");
                out.push(type_digit as u8);
            }
            out.push(b'}');
        }
        if desc_flags & DESCRIBE_SYSTEM != 0 {
            if let Some(system_info) = self.callbacks.system_info.as_mut() {
                if has_content {
                    out.push(b',');
                }
                out.extend_from_slice(system_info().as_bytes());
            }
        }
        out.push(b'}');
    }

    // ===================================================================
    // Drain and teardown
    // ===================================================================

    /// True while confirmables are still awaiting their ACK.
    #[must_use]
    pub fn has_unacknowledged_requests(&self) -> bool {
        self.channel.has_unacknowledged_requests()
    }

    /// Run the loop until every confirmable is resolved or the timeout
    /// elapses (sleep / graceful disconnect).
    pub fn wait_confirmable(&mut self, timeout_ms: u32) -> Result<()> {
        let start = self.platform.millis();
        while self.has_unacknowledged_requests() {
            if self.platform.millis().saturating_sub(start) > u64::from(timeout_ms) {
                log::warn!("[protocol] drain timed out with messages in flight");
                return Err(Error::Timeout);
            }
            self.event_loop()?;
        }
        Ok(())
    }

    /// Cancel everything in flight (disconnect). Every pending completion
    /// fires with [`Error::Cancelled`].
    pub fn cancel_all(&mut self) {
        self.ack_handlers.clear(Error::Cancelled);
        self.publisher.cancel_all();
        self.chunked.cancel();
        self.channel.clear();
        self.status = ProtocolStatus::ChannelInit;
    }
}

/// Extract the describe selector from a describe request; invalid values
/// fall back to the default document.
fn describe_flags(message: &Message) -> u8 {
    for (number, value) in message.options() {
        if number == crate::coap::option::URI_QUERY && value.len() == 1 {
            if value[0] <= DESCRIBE_MAX {
                return value[0];
            }
            log::warn!("[protocol] invalid describe flags {:#04x}", value[0]);
            return DESCRIBE_DEFAULT;
        }
    }
    DESCRIBE_DEFAULT
}
