// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Subscription table: event-name prefix filters and delivery dispatch.
//!
//! Every inbound event is offered to every subscription; a subscription
//! matches when its filter is a prefix of the event name and, if it carries
//! a device filter, the publisher device id at the head of the payload
//! matches. Overlapping filters all fire.
//!
//! Subscriptions are re-announced to the broker after every successful
//! handshake (GET `/e/<name>`, MyDevices scope encoded as the `u`
//! Uri-Query).

use crate::coap::codec::InboundEvent;
use crate::config::{DEVICE_ID_LEN, MAX_EVENT_NAME_LEN};

/// Which publishers a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    /// Events from devices of the owning account.
    MyDevices,
    /// Events from every device; forbidden with an empty filter.
    Firehose,
}

/// Handler invoked with (event name, payload).
pub type EventHandler = Box<dyn FnMut(&str, &[u8])>;

struct Subscription {
    filter: String,
    handler: EventHandler,
    scope: EventScope,
    device_id: Option<[u8; DEVICE_ID_LEN]>,
}

/// Announcement data for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub filter: String,
    pub scope: EventScope,
    pub device_id: Option<[u8; DEVICE_ID_LEN]>,
}

/// The subscription table.
#[derive(Default)]
pub struct SubscriptionTable {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; the filter is truncated to the event-name
    /// maximum. An unfiltered Firehose subscription is rejected.
    pub fn add(
        &mut self,
        filter: &str,
        handler: EventHandler,
        scope: EventScope,
        device_id: Option<[u8; DEVICE_ID_LEN]>,
    ) -> bool {
        if filter.is_empty() && scope == EventScope::Firehose {
            log::warn!("[events] unfiltered firehose subscription rejected");
            return false;
        }
        let mut filter = filter.to_string();
        filter.truncate(MAX_EVENT_NAME_LEN);
        log::trace!("[events] subscribed filter=\"{}\"", filter);
        self.subscriptions.push(Subscription {
            filter,
            handler,
            scope,
            device_id,
        });
        true
    }

    /// Remove every subscription.
    pub fn remove_all(&mut self) {
        self.subscriptions.clear();
    }

    /// Offer one event to every matching subscription.
    ///
    /// Returns the number of handlers that fired.
    pub fn deliver(&mut self, event: &InboundEvent) -> usize {
        let mut fired = 0;
        for sub in &mut self.subscriptions {
            if !event.name.starts_with(&sub.filter) {
                continue;
            }
            if let Some(device_id) = &sub.device_id {
                // Device-filtered subscriptions match the publisher id at
                // the head of the payload.
                if event.data.len() < DEVICE_ID_LEN || event.data[..DEVICE_ID_LEN] != device_id[..]
                {
                    continue;
                }
            }
            (sub.handler)(&event.name, &event.data);
            fired += 1;
        }
        if fired == 0 {
            log::trace!("[events] no subscription matched \"{}\"", event.name);
        }
        fired
    }

    /// Snapshot of the announcements to replay after a handshake.
    #[must_use]
    pub fn announcements(&self) -> Vec<Announcement> {
        self.subscriptions
            .iter()
            .map(|s| Announcement {
                filter: s.filter.clone(),
                scope: s.scope,
                device_id: s.device_id,
            })
            .collect()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// True when no subscription is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
