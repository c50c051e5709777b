// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-PV server state and SID allocation.

use crate::protocol::PvValue;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Local observer of client-initiated writes: `(name, value, text)`.
pub type ServerCallback = Arc<dyn Fn(&str, &PvValue, &str) + Send + Sync>;

/// Line-oriented observer of client-initiated writes.
pub type ServerWriter = Arc<dyn Fn(&str) + Send + Sync>;

/// Process-wide monotonic SID counter; SIDs are never reused within one
/// server process lifetime.
static NEXT_SID: AtomicU32 = AtomicU32::new(0);

pub fn next_channel_sid() -> u32 {
    NEXT_SID.fetch_add(1, Ordering::Relaxed) + 1
}

/// One client's subscription to a PV.
#[derive(Debug, Clone, Copy)]
pub struct Subscriber {
    /// Client-assigned ID echoed in every EVENT_ADD.
    pub subscription_id: u32,
    /// Wire type the client asked for; updates are re-encoded to it.
    pub data_type: u16,
    pub data_count: u16,
}

/// State information for one hosted process variable.
pub struct ServerPv {
    pub name: String,
    /// Last known value; `None` until the first put for provider-backed
    /// names.
    pub value: Option<PvValue>,
    /// Server-assigned channel ID, unique for the process lifetime.
    pub channel_sid: u32,
    pub last_updated: Option<SystemTime>,
    /// Subscribers in insertion order, keyed by the client's TCP peer
    /// address. Updates are fanned out in this order.
    pub subscribers: Vec<(SocketAddr, Subscriber)>,
    pub callbacks: Vec<ServerCallback>,
    pub writers: Vec<ServerWriter>,
}

impl ServerPv {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            channel_sid: next_channel_sid(),
            last_updated: None,
            subscribers: Vec::new(),
            callbacks: Vec::new(),
            writers: Vec::new(),
        }
    }

    /// Insert or refresh a subscription, keeping the original insertion
    /// position on refresh.
    pub fn subscribe(&mut self, addr: SocketAddr, subscriber: Subscriber) {
        for (existing_addr, existing) in &mut self.subscribers {
            if *existing_addr == addr {
                *existing = subscriber;
                return;
            }
        }
        self.subscribers.push((addr, subscriber));
    }

    /// Remove the subscription matching `(addr, subscription_id)`.
    pub fn unsubscribe(&mut self, addr: SocketAddr, subscription_id: u32) {
        self.subscribers
            .retain(|(a, s)| !(*a == addr && s.subscription_id == subscription_id));
    }

    /// Remove every subscription of a disconnected client.
    pub fn drop_client(&mut self, addr: SocketAddr) {
        self.subscribers.retain(|(a, _)| *a != addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_sid_allocation_is_monotonic() {
        let first = next_channel_sid();
        let second = next_channel_sid();
        let third = ServerPv::new("TEST:A.VAL").channel_sid;
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_subscribe_keeps_insertion_order() {
        let mut pv = ServerPv::new("TEST:A.VAL");
        pv.subscribe(addr(1000), Subscriber { subscription_id: 1, data_type: 20, data_count: 1 });
        pv.subscribe(addr(2000), Subscriber { subscription_id: 2, data_type: 20, data_count: 1 });
        // Refreshing the first subscription must not move it to the back.
        pv.subscribe(addr(1000), Subscriber { subscription_id: 9, data_type: 19, data_count: 1 });

        assert_eq!(pv.subscribers.len(), 2);
        assert_eq!(pv.subscribers[0].0, addr(1000));
        assert_eq!(pv.subscribers[0].1.subscription_id, 9);
        assert_eq!(pv.subscribers[1].0, addr(2000));
    }

    #[test]
    fn test_unsubscribe_matches_both_keys() {
        let mut pv = ServerPv::new("TEST:A.VAL");
        pv.subscribe(addr(1000), Subscriber { subscription_id: 1, data_type: 20, data_count: 1 });
        // Wrong subscription ID: no removal.
        pv.unsubscribe(addr(1000), 2);
        assert_eq!(pv.subscribers.len(), 1);
        pv.unsubscribe(addr(1000), 1);
        assert!(pv.subscribers.is_empty());
    }

    #[test]
    fn test_drop_client() {
        let mut pv = ServerPv::new("TEST:A.VAL");
        pv.subscribe(addr(1000), Subscriber { subscription_id: 1, data_type: 20, data_count: 1 });
        pv.subscribe(addr(2000), Subscriber { subscription_id: 2, data_type: 20, data_count: 1 });
        pv.drop_client(addr(1000));
        assert_eq!(pv.subscribers.len(), 1);
        assert_eq!(pv.subscribers[0].0, addr(2000));
    }
}
