// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! The DTLS message channel: one CoAP frame per application record.
//!
//! Owns the record layer, the in-flight handshake, and the
//! session-migration state. Establishment first attempts to restore a
//! persisted session (no wire exchange); otherwise it drives a fresh
//! handshake bounded by the link's handshake timeout.
//!
//! **Migration.** A NAT rebind makes the broker emit a characteristic
//! 15-byte malformed record. On the first sighting the channel flags the
//! session as moving: every outbound application record is rewritten as a
//! move-session record (type 0xFE) carrying the device id, and a ping is
//! sent to elicit traffic. The first successful inbound record clears the
//! flag and persists the session. A second sighting before that is fatal.

use p256::ecdsa::{SigningKey, VerifyingKey};

use super::crypto::{self, KeyMaterial, MASTER_SECRET_LEN, POINT_LEN};
use super::handshake::{Handshake, HandshakeIdentity};
use super::record::{
    wrap_move_session, RecordIter, RecordLayer, CONTENT_ALERT, CONTENT_APPLICATION_DATA,
    CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE, REBIND_SIGNATURE,
};
use super::session::{SessionPersist, SessionStore, BLOB_LEN};
use super::Credentials;
use crate::coap::{codec, ChannelCommand, EstablishOutcome, Message, MessageChannel,
    SKIP_SESSION_RESUME_HELLO};
use crate::config::{DEVICE_ID_LEN, SESSION_BLOB_MAX};
use crate::protocol::{Error, Platform, Result};
use crate::transport::{Transport, TransportStatus};

/// Datagram scratch size: record overhead on top of the largest CoAP frame.
const SCRATCH_LEN: usize = 2048;

/// Datagrams drained per establish step, so one loop pass can absorb a
/// whole server flight.
const ESTABLISH_DRAIN: usize = 8;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No session; next establish resumes or starts a handshake.
    Init,
    /// Handshake flights in progress.
    Handshaking,
    /// Application records flow.
    Connected,
    /// Torn down, waiting for the supervisor.
    Closing,
}

/// DTLS channel over any datagram transport.
pub struct DtlsChannel<T: Transport> {
    transport: T,
    device_id: [u8; DEVICE_ID_LEN],
    signing: SigningKey,
    device_point: [u8; POINT_LEN],
    server_key: VerifyingKey,
    server_fingerprint: [u8; 32],
    session_store: Box<dyn SessionStore>,
    handshake_timeout_ms: u32,
    status: ChannelStatus,
    layer: RecordLayer,
    handshake: Option<Handshake>,
    handshake_deadline: u64,
    master: Option<[u8; MASTER_SECRET_LEN]>,
    keys: Option<KeyMaterial>,
    move_session: bool,
    malformed_counter: u8,
}

impl<T: Transport> DtlsChannel<T> {
    /// Parse the credentials and wrap the transport.
    pub fn new(
        transport: T,
        credentials: &Credentials,
        session_store: Box<dyn SessionStore>,
        handshake_timeout_ms: u32,
    ) -> Result<Self> {
        credentials.validate()?;
        let device = crypto::parse_device_key(&credentials.private_key_der)?;
        let server_key = crypto::parse_server_public(&credentials.server_public_der)?;
        Ok(Self {
            transport,
            device_id: credentials.device_id,
            signing: device.signing,
            device_point: device.public_point,
            server_key,
            server_fingerprint: crypto::key_fingerprint(&credentials.server_public_der),
            session_store,
            handshake_timeout_ms,
            status: ChannelStatus::Init,
            layer: RecordLayer::new(),
            handshake: None,
            handshake_deadline: 0,
            master: None,
            keys: None,
            move_session: false,
            malformed_counter: 0,
        })
    }

    /// Host transport, for the supervisor's connect/disconnect.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// True while the session-move flag is raised.
    #[must_use]
    pub fn is_moving_session(&self) -> bool {
        self.move_session
    }

    /// Reset the channel state machine ahead of a new establish cycle.
    pub fn init_status(&mut self) {
        self.status = ChannelStatus::Init;
        self.layer = RecordLayer::new();
        self.handshake = None;
        self.malformed_counter = 0;
    }

    /// Step the establishment state machine; call once per loop pass.
    pub fn establish(
        &mut self,
        flags: &mut u32,
        platform: &mut dyn Platform,
    ) -> Result<EstablishOutcome> {
        match self.status {
            ChannelStatus::Init => self.establish_init(flags, platform),
            ChannelStatus::Handshaking => self.establish_handshake(platform),
            ChannelStatus::Connected => Ok(EstablishOutcome::SessionConnected),
            ChannelStatus::Closing => Err(Error::InvalidState),
        }
    }

    fn establish_init(
        &mut self,
        flags: &mut u32,
        platform: &mut dyn Platform,
    ) -> Result<EstablishOutcome> {
        // Resume path: a valid persisted blob revives the session without
        // any wire exchange.
        let mut blob = [0u8; SESSION_BLOB_MAX];
        let n = self.session_store.restore(&mut blob);
        if n >= BLOB_LEN as i32 {
            match SessionPersist::decode(
                &blob[..n as usize],
                &self.device_id,
                &self.server_fingerprint,
            ) {
                Ok(session) => {
                    log::info!("[DTLS] resuming persisted session");
                    self.layer = RecordLayer::resume(
                        &session.keys,
                        session.epoch,
                        session.sequence_out,
                        session.sequence_in,
                    );
                    self.master = Some(session.master);
                    self.keys = Some(session.keys);
                    self.status = ChannelStatus::Connected;
                    // Push the sequence slack forward for the next boot.
                    self.save_session();
                    *flags |= SKIP_SESSION_RESUME_HELLO;
                    return Ok(EstablishOutcome::SessionResumed);
                }
                Err(_) => {
                    log::debug!("[DTLS] persisted session rejected, full handshake");
                    self.session_store.discard();
                }
            }
        }

        log::info!("[DTLS] starting handshake");
        let now = platform.millis();
        let (handshake, first_flight) = Handshake::start(&mut self.layer, platform, now)?;
        self.send_raw(&first_flight)?;
        self.handshake = Some(handshake);
        self.handshake_deadline = now + u64::from(self.handshake_timeout_ms);
        self.status = ChannelStatus::Handshaking;
        Ok(EstablishOutcome::InProgress)
    }

    fn establish_handshake(&mut self, platform: &mut dyn Platform) -> Result<EstablishOutcome> {
        let now = platform.millis();
        if now >= self.handshake_deadline {
            log::warn!("[DTLS] handshake timeout");
            self.status = ChannelStatus::Init;
            self.handshake = None;
            return Err(Error::Timeout);
        }

        let mut scratch = [0u8; SCRATCH_LEN];
        for _ in 0..ESTABLISH_DRAIN {
            let n = match self.transport.receive(&mut scratch) {
                TransportStatus::Done(n) => n,
                TransportStatus::Idle => break,
                TransportStatus::Fatal => return Err(Error::Io),
            };
            if n <= 1 {
                continue;
            }
            self.feed_handshake_datagram(&scratch[..n], now)?;
            let finished = self
                .handshake
                .as_mut()
                .filter(|hs| hs.is_complete())
                .map(Handshake::take_keys)
                .transpose()?;
            if let Some((master, keys)) = finished {
                self.handshake = None;
                self.master = Some(master);
                self.keys = Some(keys);
                self.status = ChannelStatus::Connected;
                self.malformed_counter = 0;
                self.save_session();
                return Ok(EstablishOutcome::SessionConnected);
            }
        }

        // Drive flight retransmission while waiting.
        if let Some(flight) = self
            .handshake
            .as_mut()
            .and_then(|hs| hs.poll_retransmit(now))
        {
            self.send_raw(&flight)?;
        }
        Ok(EstablishOutcome::InProgress)
    }

    fn feed_handshake_datagram(&mut self, datagram: &[u8], now: u64) -> Result<()> {
        let handshake = self.handshake.as_mut().ok_or(Error::InvalidState)?;
        let identity = HandshakeIdentity {
            signing: &self.signing,
            device_point: &self.device_point,
            server_key: &self.server_key,
        };
        let records: Vec<_> = RecordIter::new(datagram)
            .map(|(h, b)| (h, b.to_vec()))
            .collect();
        let mut outgoing = Vec::new();
        for (header, body) in records {
            match header.content_type {
                CONTENT_CHANGE_CIPHER_SPEC => handshake.handle_ccs(&mut self.layer)?,
                CONTENT_HANDSHAKE => {
                    let plaintext = self.layer.decode(&header, &body)?;
                    if let Some(response) =
                        handshake.handle_record(&plaintext, &mut self.layer, &identity, now)?
                    {
                        outgoing.push(response);
                    }
                }
                CONTENT_ALERT => {
                    log::warn!("[DTLS] alert during handshake");
                    return Err(Error::Io);
                }
                _ => {}
            }
        }
        for datagram in outgoing {
            self.send_raw(&datagram)?;
        }
        Ok(())
    }

    /// Pull one datagram and return the decrypted CoAP frame, if any.
    ///
    /// `msg` is left empty for keepalive padding, handshake leftovers, and
    /// consumed migration signatures.
    pub fn receive(&mut self, msg: &mut Message) -> Result<()> {
        msg.clear();
        if self.status != ChannelStatus::Connected {
            return Err(Error::InvalidState);
        }

        let mut scratch = [0u8; SCRATCH_LEN];
        let n = match self.transport.receive(&mut scratch) {
            TransportStatus::Done(n) => n,
            TransportStatus::Idle => return Ok(()),
            TransportStatus::Fatal => return Err(Error::Io),
        };

        // 0/1-byte datagrams are keepalive padding.
        if n <= 1 {
            return Ok(());
        }

        // NAT-rebind detection.
        if scratch[..n] == REBIND_SIGNATURE {
            self.malformed_counter += 1;
            if self.malformed_counter == 1 {
                log::info!("[DTLS] source address changed, moving session");
                self.move_session = true;
                let mut ping = Message::from_bytes(codec::ping(0));
                ping.set_id(0);
                self.send(&mut ping)?;
                return Ok(());
            }
            log::warn!("[DTLS] repeated rebind signature, closing session");
            self.reset_session();
            return Err(Error::Io);
        }
        self.malformed_counter = 0;

        let records: Vec<_> = RecordIter::new(&scratch[..n])
            .map(|(h, b)| (h, b.to_vec()))
            .collect();
        for (header, body) in records {
            match header.content_type {
                CONTENT_APPLICATION_DATA => match self.layer.decode(&header, &body) {
                    Ok(plaintext) => {
                        self.cancel_move_session();
                        msg.set_bytes(&plaintext);
                        return Ok(());
                    }
                    Err(_) => {
                        // Stray corrupt datagram; drop the record and let
                        // retransmission recover.
                        log::debug!("[DTLS] dropping undecryptable record");
                    }
                },
                CONTENT_ALERT => {
                    log::warn!("[DTLS] alert received, closing session");
                    self.reset_session();
                    return Err(Error::Io);
                }
                _ => {
                    // Late handshake retransmissions after completion.
                    log::trace!(
                        "[DTLS] ignoring record type={} post-handshake",
                        header.content_type
                    );
                }
            }
        }
        Ok(())
    }

    /// Clear the move flag after a successful inbound record, persisting
    /// the re-bound session.
    fn cancel_move_session(&mut self) {
        if self.move_session {
            log::debug!("[DTLS] move-session cleared");
            self.move_session = false;
            self.save_session();
        }
    }

    fn reset_session(&mut self) {
        self.move_session = false;
        self.handshake = None;
        self.layer = RecordLayer::new();
        self.status = ChannelStatus::Init;
    }

    fn save_session(&mut self) {
        let (Some(master), Some(keys)) = (self.master.as_ref(), self.keys.as_ref()) else {
            return;
        };
        let (sequence_out, sequence_in) = self.layer.sequences();
        let blob = SessionPersist {
            master: *master,
            keys: keys.clone(),
            epoch: self.layer.write_epoch(),
            sequence_out,
            sequence_in,
            device_id: self.device_id,
            server_fingerprint: self.server_fingerprint,
        }
        .encode();
        if self.session_store.save(&blob) < 0 {
            log::debug!("[DTLS] session save declined by host");
        }
    }

    fn send_raw(&mut self, datagram: &[u8]) -> Result<()> {
        match self.transport.send(datagram) {
            TransportStatus::Fatal => Err(Error::Io),
            // A would-block drop is UDP loss; retransmission covers it.
            _ => Ok(()),
        }
    }
}

impl<T: Transport> MessageChannel for DtlsChannel<T> {
    fn send(&mut self, msg: &mut Message) -> Result<()> {
        if self.status != ChannelStatus::Connected {
            return Err(Error::InvalidState);
        }
        let record = self
            .layer
            .encode(CONTENT_APPLICATION_DATA, msg.bytes())?;
        let datagram = if self.move_session {
            log::trace!("[DTLS] tagging record for session move");
            wrap_move_session(record, &self.device_id)
        } else {
            record
        };
        self.send_raw(&datagram)
    }

    fn command(&mut self, cmd: ChannelCommand) -> Result<()> {
        match cmd {
            ChannelCommand::Close => {
                log::debug!("[DTLS] close");
                self.reset_session();
                Ok(())
            }
            ChannelCommand::DiscardSession => {
                log::debug!("[DTLS] discard session");
                self.reset_session();
                self.session_store.discard();
                // Forces the caller to re-establish.
                Err(Error::SessionDiscarded)
            }
            ChannelCommand::MoveSession => {
                self.move_session = true;
                Ok(())
            }
            ChannelCommand::SaveSession => {
                self.save_session();
                Ok(())
            }
            ChannelCommand::LoadSession => Ok(()),
        }
    }
}
