// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Outbound event publishing: rate limiting and block-wise transfer.
//!
//! **Rate limit.** Non-system events are admitted at a burst of 4 per
//! second (sliding window over the last 5 timestamps); system-prefixed
//! events at 255 per 65-second window. The check applies only to the first
//! block of a transaction.
//!
//! **Block-wise transfer.** Payloads beyond one CoAP block split into at
//! most 5 blocks of 1024 bytes, sent one at a time as confirmables. On a
//! `2.31 Continue` the next block goes out; the final block's ACK fires the
//! transaction's completion callback exactly once; any error fires it with
//! that error and tears the transaction down. At most
//! [`MAX_CONCURRENT_MESSAGES`] transactions run simultaneously.

use super::ack::CompletionHandler;
use crate::coap::{code, codec, Message};
use crate::config::{MAX_BLOCKS_NUMBER, MAX_BLOCK_SIZE, MAX_CONCURRENT_MESSAGES};
use crate::protocol::{Error, EventType, Result};

/// Prefix that marks system events, which use the wider rate window.
pub const SYSTEM_EVENT_PREFIX: &str = "trackle";

struct BlockTransaction {
    token: u8,
    event_name: String,
    buffer: Vec<u8>,
    block_count: usize,
    current_block: usize,
    ttl: u32,
    event_type: EventType,
    pending_msg_id: Option<u16>,
    completion: Option<CompletionHandler>,
}

impl BlockTransaction {
    fn block(&self, index: usize) -> &[u8] {
        let start = index * MAX_BLOCK_SIZE;
        let end = (start + MAX_BLOCK_SIZE).min(self.buffer.len());
        &self.buffer[start..end]
    }

    fn build_block(&self, index: usize) -> Message {
        Message::from_bytes(codec::event(
            0,
            self.token,
            &self.event_name,
            self.block(index),
            self.ttl,
            index as u8,
            self.block_count as u8,
            self.event_type,
            true,
        ))
    }
}

/// Reaction to a broker reply on a block transaction.
pub enum BlockReply {
    /// Send this next block and report its id with
    /// [`Publisher::note_block_sent`].
    Continue { token: u8, message: Message },
    /// Transaction finished; fire the completion with the outcome.
    Done {
        token: u8,
        completion: Option<CompletionHandler>,
        outcome: Result<()>,
    },
}

/// Event publisher state.
pub struct Publisher {
    system_window: u16,
    system_events_in_window: u8,
    recent_event_ticks: [u64; 5],
    event_tick_idx: usize,
    transactions: Vec<BlockTransaction>,
}

impl Publisher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system_window: 0,
            system_events_in_window: 0,
            // Primed in the past so the first burst is admitted.
            recent_event_ticks: [u64::MAX - 1_000; 5],
            event_tick_idx: 0,
            transactions: Vec::new(),
        }
    }

    /// True when the event must be dropped for bandwidth.
    pub fn is_rate_limited(&mut self, event_name: &str, now: u64) -> bool {
        if event_name.starts_with(SYSTEM_EVENT_PREFIX) {
            // 65-second buckets from the millis counter's high bits; the
            // equality also handles counter wrap.
            let window = (now >> 16) as u16;
            if window == self.system_window {
                if self.system_events_in_window == 255 {
                    return true;
                }
            } else {
                self.system_window = window;
                self.system_events_in_window = 0;
            }
            self.system_events_in_window += 1;
            false
        } else {
            self.recent_event_ticks[self.event_tick_idx] = now;
            self.event_tick_idx = (self.event_tick_idx + 1) % self.recent_event_ticks.len();
            let oldest = self.recent_event_ticks[self.event_tick_idx];
            if now.wrapping_sub(oldest) < 1_000 {
                log::warn!("[publish] not published: bandwidth exceeded");
                return true;
            }
            false
        }
    }

    /// Number of running block transactions.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Start a block-wise transaction; returns the block-0 message.
    ///
    /// The payload must need more than one block (single-packet events
    /// bypass the publisher) and fit the block budget. Fails when the
    /// transaction table is full.
    pub fn begin_blockwise(
        &mut self,
        event_name: &str,
        data: &[u8],
        ttl: u32,
        event_type: EventType,
        token: u8,
        completion: Option<CompletionHandler>,
    ) -> Result<Message> {
        if data.len() <= MAX_BLOCK_SIZE {
            return Err(Error::InvalidState);
        }
        if data.len() > MAX_BLOCK_SIZE * MAX_BLOCKS_NUMBER {
            return Err(Error::InsufficientStorage);
        }
        if self.transactions.len() >= MAX_CONCURRENT_MESSAGES {
            log::warn!("[publish] block transaction table full");
            return Err(Error::InsufficientStorage);
        }
        if self.transactions.iter().any(|t| t.token == token) {
            return Err(Error::InvalidState);
        }

        let block_count = data.len().div_ceil(MAX_BLOCK_SIZE);
        let transaction = BlockTransaction {
            token,
            event_name: event_name.to_string(),
            buffer: data.to_vec(),
            block_count,
            current_block: 0,
            ttl,
            event_type,
            pending_msg_id: None,
            completion,
        };
        let first = transaction.build_block(0);
        log::debug!(
            "[publish] blockwise \"{}\" {} bytes in {} blocks token={:#04x}",
            event_name,
            data.len(),
            block_count,
            token
        );
        self.transactions.push(transaction);
        Ok(first)
    }

    /// Record the message id the channel assigned to the in-flight block.
    pub fn note_block_sent(&mut self, token: u8, message_id: u16) {
        if let Some(t) = self.transactions.iter_mut().find(|t| t.token == token) {
            t.pending_msg_id = Some(message_id);
        }
    }

    /// Route a matched reply to its transaction, if it belongs to one.
    pub fn handle_reply(&mut self, message_id: u16, reply_code: u8) -> Option<BlockReply> {
        let idx = self
            .transactions
            .iter()
            .position(|t| t.pending_msg_id == Some(message_id))?;

        if reply_code == code::CONTINUE {
            let t = &mut self.transactions[idx];
            t.current_block += 1;
            if t.current_block < t.block_count {
                let message = t.build_block(t.current_block);
                let token = t.token;
                t.pending_msg_id = None;
                return Some(BlockReply::Continue { token, message });
            }
            // Continue past the final block: broker confusion; treat as done.
        }

        let mut t = self.transactions.swap_remove(idx);
        let outcome = if code::is_success(reply_code) {
            if t.current_block + 1 < t.block_count {
                // Final success code before all blocks went out; the broker
                // abandoned the transfer.
                Err(Error::Protocol)
            } else {
                Ok(())
            }
        } else {
            Err(crate::coap::completion_error(reply_code).unwrap_or(Error::Protocol))
        };
        Some(BlockReply::Done {
            token: t.token,
            completion: t.completion.take(),
            outcome,
        })
    }

    /// Tear down the transaction owning a timed-out message id.
    pub fn handle_timeout(&mut self, message_id: u16) -> Option<BlockReply> {
        let idx = self
            .transactions
            .iter()
            .position(|t| t.pending_msg_id == Some(message_id))?;
        let mut t = self.transactions.swap_remove(idx);
        log::warn!(
            "[publish] block transaction token={:#04x} timed out at block {}",
            t.token,
            t.current_block
        );
        Some(BlockReply::Done {
            token: t.token,
            completion: t.completion.take(),
            outcome: Err(Error::Timeout),
        })
    }

    /// Abandon every transaction (disconnect); fires completions with
    /// [`Error::Cancelled`].
    pub fn cancel_all(&mut self) {
        for mut t in self.transactions.drain(..) {
            if let Some(completion) = t.completion.take() {
                completion(Err(Error::Cancelled));
            }
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_rate_limit_four_per_second() {
        let mut publisher = Publisher::new();
        let base = 10_000;
        // 4 events inside 800ms pass, the 5th is limited.
        assert!(!publisher.is_rate_limited("app/one", base));
        assert!(!publisher.is_rate_limited("app/two", base + 200));
        assert!(!publisher.is_rate_limited("app/three", base + 400));
        assert!(!publisher.is_rate_limited("app/four", base + 600));
        assert!(publisher.is_rate_limited("app/five", base + 800));
    }

    #[test]
    fn test_rate_limit_recovers_after_window() {
        let mut publisher = Publisher::new();
        let base = 10_000;
        for i in 0..4 {
            assert!(!publisher.is_rate_limited("app/e", base + i * 100));
        }
        assert!(publisher.is_rate_limited("app/e", base + 500));
        // A second later the window has drained.
        assert!(!publisher.is_rate_limited("app/e", base + 1_600));
    }

    #[test]
    fn test_system_events_wider_window() {
        let mut publisher = Publisher::new();
        let now = 1 << 16; // one full system window in
        for _ in 0..255 {
            assert!(!publisher.is_rate_limited("trackle/device/x", now));
        }
        assert!(publisher.is_rate_limited("trackle/device/x", now));
        // Next window resets the counter.
        assert!(!publisher.is_rate_limited("trackle/device/x", now + (1 << 16)));
    }

    #[test]
    fn test_block_split_3100_bytes() {
        let mut publisher = Publisher::new();
        let payload = vec![0xAB; 3100];
        let first = publisher
            .begin_blockwise("big", &payload, 60, EventType::Private, 0x21, None)
            .expect("starts");
        assert_eq!(publisher.active_transactions(), 1);

        // Block 0 carries 1024 bytes.
        assert_eq!(first.payload().len(), 1024);

        // Walk the continuation chain: blocks 1 and 2 full, block 3 is 28.
        publisher.note_block_sent(0x21, 100);
        let sizes = [1024usize, 1024, 28];
        let mut msg_id = 100u16;
        for expected in sizes {
            match publisher.handle_reply(msg_id, code::CONTINUE) {
                Some(BlockReply::Continue { token, message }) => {
                    assert_eq!(token, 0x21);
                    assert_eq!(message.payload().len(), expected);
                    msg_id += 1;
                    publisher.note_block_sent(token, msg_id);
                }
                other => panic!(
                    "expected continue, got {:?}",
                    other.is_some().then_some("done")
                ),
            }
        }

        // Final block ACK completes the transaction.
        match publisher.handle_reply(msg_id, code::CHANGED) {
            Some(BlockReply::Done { outcome, .. }) => assert_eq!(outcome, Ok(())),
            _ => panic!("expected done"),
        }
        assert_eq!(publisher.active_transactions(), 0);
    }

    #[test]
    fn test_completion_fires_once_on_error() {
        let fired: Rc<RefCell<Vec<Result<()>>>> = Rc::new(RefCell::new(Vec::new()));
        let fired2 = Rc::clone(&fired);

        let mut publisher = Publisher::new();
        let payload = vec![0; 2048];
        publisher
            .begin_blockwise(
                "big",
                &payload,
                60,
                EventType::Public,
                0x42,
                Some(Box::new(move |outcome| fired2.borrow_mut().push(outcome))),
            )
            .expect("starts");
        publisher.note_block_sent(0x42, 7);

        match publisher.handle_reply(7, code::BAD_REQUEST) {
            Some(BlockReply::Done {
                completion,
                outcome,
                ..
            }) => {
                assert_eq!(outcome, Err(Error::CoapClientError));
                completion.expect("completion present")(outcome);
            }
            _ => panic!("expected done"),
        }
        assert_eq!(fired.borrow().len(), 1);
        // The transaction is gone; a late reply routes nowhere.
        assert!(publisher.handle_reply(7, code::CHANGED).is_none());
    }

    #[test]
    fn test_capacity_limit() {
        let mut publisher = Publisher::new();
        let payload = vec![0; 2048];
        for i in 0..MAX_CONCURRENT_MESSAGES {
            publisher
                .begin_blockwise("e", &payload, 60, EventType::Public, i as u8 + 1, None)
                .expect("starts");
        }
        assert_eq!(
            publisher
                .begin_blockwise("e", &payload, 60, EventType::Public, 0x77, None)
                .err(),
            Some(Error::InsufficientStorage)
        );
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut publisher = Publisher::new();
        let payload = vec![0; MAX_BLOCK_SIZE * MAX_BLOCKS_NUMBER + 1];
        assert_eq!(
            publisher
                .begin_blockwise("e", &payload, 60, EventType::Public, 1, None)
                .err(),
            Some(Error::InsufficientStorage)
        );
    }

    #[test]
    fn test_timeout_tears_down() {
        let mut publisher = Publisher::new();
        let payload = vec![0; 2048];
        publisher
            .begin_blockwise("e", &payload, 60, EventType::Public, 5, None)
            .expect("starts");
        publisher.note_block_sent(5, 900);

        match publisher.handle_timeout(900) {
            Some(BlockReply::Done { outcome, .. }) => assert_eq!(outcome, Err(Error::Timeout)),
            _ => panic!("expected done"),
        }
        assert_eq!(publisher.active_transactions(), 0);
    }

    #[test]
    fn test_cancel_all_fires_cancelled() {
        let fired: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
        let fired2 = Rc::clone(&fired);
        let mut publisher = Publisher::new();
        publisher
            .begin_blockwise(
                "e",
                &vec![0; 2048],
                60,
                EventType::Public,
                9,
                Some(Box::new(move |outcome| {
                    assert_eq!(outcome, Err(Error::Cancelled));
                    *fired2.borrow_mut() += 1;
                })),
            )
            .expect("starts");
        publisher.cancel_all();
        assert_eq!(*fired.borrow(), 1);
        assert_eq!(publisher.active_transactions(), 0);
    }
}
