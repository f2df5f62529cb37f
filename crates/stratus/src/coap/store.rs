// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Confirmable-message store: retransmission, duplicate suppression and
//! ack/reset matching.
//!
//! Two populations share the table, keyed by message id:
//!
//! - **Outbound confirmables** awaiting an ACK: retransmitted with doubling
//!   timeouts up to the retry limit, then reported as timed out.
//! - **Outbound ACK/RESET responses and inbound confirmable ids**: kept for
//!   one `MAX_TRANSMIT_WAIT` so a re-delivered request replays the cached
//!   response instead of re-invoking the application.
//!
//! The store is a pure state machine: it never touches the channel. Each
//! call reports what the caller must transmit or route.

use super::{CoapType, Message};
use crate::config::{MAX_RETRANSMIT, MAX_TRANSMIT_WAIT_MS};
use crate::protocol::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// Outbound confirmable awaiting an ACK.
    ConRequest,
    /// Cached outbound ACK/RESET, replayed on duplicate requests.
    Response,
    /// Inbound confirmable id seen, no response cached yet.
    InboundSeen,
}

#[derive(Debug)]
struct Entry {
    id: u16,
    data: Vec<u8>,
    kind: EntryKind,
    /// First transmission time (ConRequest only).
    send_time: u64,
    /// Next retransmission time, or expiration for cached entries.
    deadline: u64,
    retry_count: u8,
}

/// What the caller must do with a received frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Matched reply; dispatch it (completion routing, block continuation).
    Reply {
        /// True for RESET: the session is invalid.
        reset: bool,
        /// Measured request round trip in ms.
        round_trip: Option<u64>,
    },
    /// Unmatched reply or suppressed duplicate; the frame was consumed.
    Consumed {
        /// True when the consumed frame was a RESET.
        reset: bool,
    },
    /// Duplicate confirmable with a cached response: resend these bytes.
    CachedResend(Vec<u8>),
    /// Fresh message; dispatch normally.
    PassThrough,
}

/// A confirmable exchange that exhausted its retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEvent {
    /// Message id of the abandoned exchange.
    pub id: u16,
    /// True when the channel should be closed: nothing has been
    /// acknowledged since this message was first sent, so the session is
    /// presumed dead. A lone loss on an otherwise live session is
    /// tolerated.
    pub close_channel: bool,
}

/// Output of one store tick.
#[derive(Debug, Default)]
pub struct StoreTick {
    /// Frames to retransmit now.
    pub resend: Vec<Vec<u8>>,
    /// Exchanges abandoned this tick.
    pub timeouts: Vec<TimeoutEvent>,
}

/// The per-session message store.
#[derive(Debug)]
pub struct MessageStore {
    entries: Vec<Entry>,
    ack_timeout_ms: u32,
    last_ack_time: u64,
}

impl MessageStore {
    /// Create a store with the link's initial retransmission timeout.
    #[must_use]
    pub fn new(ack_timeout_ms: u32) -> Self {
        Self {
            entries: Vec::new(),
            ack_timeout_ms,
            last_ack_time: 0,
        }
    }

    /// Change the initial retransmission timeout (link type switch).
    pub fn set_ack_timeout(&mut self, ack_timeout_ms: u32) {
        self.ack_timeout_ms = ack_timeout_ms;
    }

    /// Time of the most recent inbound ACK.
    #[must_use]
    pub fn last_ack_time(&self) -> u64 {
        self.last_ack_time
    }

    /// Register an outbound frame.
    ///
    /// Confirmables enter the retransmission schedule; ACK/RESET responses
    /// are cached for duplicate replay, replacing any entry with the same id
    /// (latest wins). Non-confirmables are not tracked.
    pub fn send(&mut self, msg: &Message, now: u64) -> Result<()> {
        if !msg.has_id() {
            return Err(Error::MissingMessageId);
        }
        let id = msg.wire_id();
        log::trace!("[coap] sending message id={:#06x}", id);
        match msg.coap_type() {
            Some(CoapType::Confirmable) => {
                self.insert(Entry {
                    id,
                    data: msg.bytes().to_vec(),
                    kind: EntryKind::ConRequest,
                    send_time: now,
                    deadline: now + u64::from(self.ack_timeout_ms),
                    retry_count: 0,
                });
            }
            Some(CoapType::Acknowledgement | CoapType::Reset) => {
                self.insert(Entry {
                    id,
                    data: msg.bytes().to_vec(),
                    kind: EntryKind::Response,
                    send_time: now,
                    deadline: now + u64::from(MAX_TRANSMIT_WAIT_MS),
                    retry_count: 0,
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Process a received frame against the table.
    ///
    /// Consumed frames are cleared in place so the dispatcher skips them.
    pub fn receive(&mut self, msg: &mut Message, now: u64) -> Disposition {
        msg.decode_id();
        let id = msg.wire_id();
        match msg.coap_type() {
            Some(CoapType::Acknowledgement) => {
                self.last_ack_time = now;
                self.match_reply(msg, id, now, false)
            }
            Some(CoapType::Reset) => self.match_reply(msg, id, now, true),
            Some(CoapType::Confirmable) => self.dedup_confirmable(msg, id, now),
            _ => Disposition::PassThrough,
        }
    }

    fn match_reply(&mut self, msg: &mut Message, id: u16, now: u64, reset: bool) -> Disposition {
        let matched = self
            .entries
            .iter()
            .position(|e| e.id == id && e.kind == EntryKind::ConRequest);
        match matched {
            Some(idx) => {
                let round_trip = now.saturating_sub(self.entries[idx].send_time);
                self.entries.swap_remove(idx);
                log::trace!("[coap] received {} for id={:#06x}", if reset { "RST" } else { "ACK" }, id);
                Disposition::Reply {
                    reset,
                    round_trip: Some(round_trip),
                }
            }
            None => {
                // Already acknowledged or never ours; consume it.
                msg.clear();
                Disposition::Consumed { reset }
            }
        }
    }

    fn dedup_confirmable(&mut self, msg: &mut Message, id: u16, now: u64) -> Disposition {
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            let cached = match entry.kind {
                EntryKind::Response => Some(entry.data.clone()),
                _ => None,
            };
            msg.clear();
            log::debug!("[coap] duplicate confirmable id={:#06x}", id);
            return match cached {
                Some(data) => Disposition::CachedResend(data),
                None => Disposition::Consumed { reset: false },
            };
        }
        // First sighting: remember the id so a retransmission is suppressed
        // until the application's response (stored via `send`) replaces it.
        self.insert(Entry {
            id,
            data: Vec::new(),
            kind: EntryKind::InboundSeen,
            send_time: now,
            deadline: now + u64::from(MAX_TRANSMIT_WAIT_MS),
            retry_count: 0,
        });
        Disposition::PassThrough
    }

    /// Advance timers: collect retransmissions and expire dead exchanges.
    pub fn tick(&mut self, now: u64) -> StoreTick {
        let mut out = StoreTick::default();
        let last_ack = self.last_ack_time;
        let ack_timeout = u64::from(self.ack_timeout_ms);
        self.entries.retain_mut(|entry| {
            if now < entry.deadline {
                return true;
            }
            match entry.kind {
                EntryKind::ConRequest => {
                    if entry.retry_count < MAX_RETRANSMIT {
                        entry.retry_count += 1;
                        entry.deadline = now + (ack_timeout << entry.retry_count);
                        log::debug!(
                            "[coap] retransmit id={:#06x} attempt={}",
                            entry.id,
                            entry.retry_count
                        );
                        out.resend.push(entry.data.clone());
                        true
                    } else {
                        log::warn!("[coap] unacknowledged message id={:#06x}", entry.id);
                        out.timeouts.push(TimeoutEvent {
                            id: entry.id,
                            close_channel: entry.send_time > last_ack,
                        });
                        false
                    }
                }
                EntryKind::Response | EntryKind::InboundSeen => false,
            }
        });
        out
    }

    /// Drop everything, returning the ids of confirmables still in flight.
    pub fn clear(&mut self) -> Vec<u16> {
        let pending = self
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::ConRequest)
            .map(|e| e.id)
            .collect();
        self.entries.clear();
        self.last_ack_time = 0;
        pending
    }

    /// True while any outbound confirmable awaits its ACK.
    #[must_use]
    pub fn has_unacknowledged_requests(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == EntryKind::ConRequest)
    }

    fn insert(&mut self, entry: Entry) {
        // Latest entry wins on id collision; an application response
        // replaces the inbound-seen placeholder this way.
        self.entries.retain(|e| e.id != entry.id);
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::codec;

    fn con_message(id: u16) -> Message {
        let mut msg = Message::from_bytes(codec::ping(id));
        msg.set_id(id);
        msg
    }

    fn ack_frame(id: u16) -> Message {
        Message::from_bytes(codec::empty_ack(id))
    }

    #[test]
    fn test_send_requires_id() {
        let mut store = MessageStore::new(2_000);
        let msg = Message::from_bytes(codec::ping(1));
        assert_eq!(store.send(&msg, 0), Err(Error::MissingMessageId));
    }

    #[test]
    fn test_ack_clears_entry_and_measures_round_trip() {
        let mut store = MessageStore::new(2_000);
        store.send(&con_message(7), 100).expect("tracked");
        assert!(store.has_unacknowledged_requests());

        let mut reply = ack_frame(7);
        let disposition = store.receive(&mut reply, 150);
        assert_eq!(
            disposition,
            Disposition::Reply {
                reset: false,
                round_trip: Some(50)
            }
        );
        assert!(!store.has_unacknowledged_requests());
        assert_eq!(store.last_ack_time(), 150);
    }

    #[test]
    fn test_duplicate_ack_is_consumed() {
        let mut store = MessageStore::new(2_000);
        store.send(&con_message(7), 100).expect("tracked");
        let mut first = ack_frame(7);
        store.receive(&mut first, 150);
        let mut second = ack_frame(7);
        assert_eq!(
            store.receive(&mut second, 160),
            Disposition::Consumed { reset: false }
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_retransmit_doubles_until_limit() {
        let mut store = MessageStore::new(2_000);
        store.send(&con_message(9), 100).expect("tracked");

        // First deadline 2 s after send; each retry doubles.
        let tick = store.tick(2_100);
        assert_eq!(tick.resend.len(), 1);
        assert!(tick.timeouts.is_empty());

        let tick = store.tick(2_100 + 4_000);
        assert_eq!(tick.resend.len(), 1);
        let tick = store.tick(6_100 + 8_000);
        assert_eq!(tick.resend.len(), 1);
        let tick = store.tick(14_100 + 16_000);
        assert_eq!(tick.resend.len(), 1);

        // Fifth deadline: retries exhausted.
        let tick = store.tick(30_100 + 32_000);
        assert!(tick.resend.is_empty());
        assert_eq!(tick.timeouts.len(), 1);
        assert_eq!(tick.timeouts[0].id, 9);
        assert!(tick.timeouts[0].close_channel);
        assert!(!store.has_unacknowledged_requests());
    }

    #[test]
    fn test_timeout_keeps_channel_when_acks_flow() {
        let mut store = MessageStore::new(1_000);
        store.send(&con_message(1), 0).expect("tracked");
        store.send(&con_message(2), 10).expect("tracked");

        // Message 2 gets acked after message 1 was sent.
        let mut reply = ack_frame(2);
        store.receive(&mut reply, 50);

        // Run message 1 to exhaustion.
        let mut now = 1_000;
        loop {
            let tick = store.tick(now);
            if !tick.timeouts.is_empty() {
                assert!(!tick.timeouts[0].close_channel, "ack arrived after send");
                break;
            }
            now += 60_000;
        }
    }

    #[test]
    fn test_inbound_dedup_replays_cached_response() {
        let mut store = MessageStore::new(2_000);

        // First delivery passes through.
        let mut request = Message::from_bytes(vec![0x40, 0x02, 0x00, 0x21, 0xB1, b'h']);
        assert_eq!(store.receive(&mut request, 0), Disposition::PassThrough);

        // Application responds; the response replaces the placeholder.
        let mut response = Message::from_bytes(codec::empty_ack(0x21));
        response.set_id(0x21);
        store.send(&response, 1).expect("cached");

        // Re-delivery: suppressed, cached bytes returned.
        let mut duplicate = Message::from_bytes(vec![0x40, 0x02, 0x00, 0x21, 0xB1, b'h']);
        match store.receive(&mut duplicate, 100) {
            Disposition::CachedResend(bytes) => assert_eq!(bytes, codec::empty_ack(0x21)),
            other => panic!("expected cached resend, got {:?}", other),
        }
        assert!(duplicate.is_empty());
    }

    #[test]
    fn test_inbound_dedup_without_response() {
        let mut store = MessageStore::new(2_000);
        let mut request = Message::from_bytes(vec![0x40, 0x02, 0x00, 0x33, 0xB1, b'f']);
        assert_eq!(store.receive(&mut request, 0), Disposition::PassThrough);

        let mut duplicate = Message::from_bytes(vec![0x40, 0x02, 0x00, 0x33, 0xB1, b'f']);
        assert_eq!(
            store.receive(&mut duplicate, 10),
            Disposition::Consumed { reset: false }
        );
    }

    #[test]
    fn test_dedup_entry_expires() {
        let mut store = MessageStore::new(2_000);
        let mut request = Message::from_bytes(vec![0x40, 0x02, 0x00, 0x33, 0xB1, b'f']);
        store.receive(&mut request, 0);
        store.tick(u64::from(MAX_TRANSMIT_WAIT_MS) + 1);

        // Past MAX_TRANSMIT_WAIT the id is forgotten and delivery repeats.
        let mut late = Message::from_bytes(vec![0x40, 0x02, 0x00, 0x33, 0xB1, b'f']);
        assert_eq!(
            store.receive(&mut late, u64::from(MAX_TRANSMIT_WAIT_MS) + 2),
            Disposition::PassThrough
        );
    }

    #[test]
    fn test_reset_matches_like_ack() {
        let mut store = MessageStore::new(2_000);
        store.send(&con_message(5), 0).expect("tracked");
        let mut reply = Message::from_bytes(codec::reset(5));
        match store.receive(&mut reply, 20) {
            Disposition::Reply { reset, .. } => assert!(reset),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_clear_reports_pending() {
        let mut store = MessageStore::new(2_000);
        store.send(&con_message(1), 0).expect("tracked");
        store.send(&con_message(2), 0).expect("tracked");
        let mut pending = store.clear();
        pending.sort_unstable();
        assert_eq!(pending, vec![1, 2]);
        assert!(!store.has_unacknowledged_requests());
    }
}
