// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-PV client state.
//!
//! A [`ClientPv`] is created on first user reference and lives until the
//! client disconnects or the server cancels the subscription. Its lifecycle
//! is driven entirely by the dispatcher; the channel state is derived from
//! which identifiers have been learned so far rather than stored as a
//! separate field that could drift.

use crate::client::callback::{Monitor, WriterFn};
use crate::protocol::PvValue;
use std::net::SocketAddr;
use std::time::{Instant, SystemTime};

/// Where a PV currently is in the discovery -> subscription pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No SEARCH reply yet.
    Searching,
    /// Server known, CREATE_CHAN outstanding.
    Connecting,
    /// Channel open, EVENT_ADD not sent yet.
    ChannelOpen,
    /// Receiving update notifications.
    Subscribed,
}

/// State information for one process variable on the client side.
pub struct ClientPv {
    pub name: String,
    /// Client-allocated channel ID, stable for the life of this record.
    pub channel_cid: u32,
    /// (IP, TCP port) of the hosting server, once discovered.
    pub server_addr: Option<SocketAddr>,
    /// Server-allocated channel ID from the CREATE_CHAN reply.
    pub channel_sid: Option<u32>,
    /// Wire type reported by CREATE_CHAN / refreshed by updates.
    pub data_type: Option<u16>,
    pub data_count: Option<u16>,
    /// Read/write permission bits from ACCESS_RIGHTS.
    pub access_bits: Option<u32>,
    /// Client-allocated ID of the active EVENT_ADD stream.
    pub subscription_id: Option<u32>,
    /// Last used write transaction ID.
    pub ioid: u32,
    /// Most recent payload in wire form, decoded on demand.
    pub last_payload: Option<Vec<u8>>,
    /// Event timestamp of the last update (server clock when available).
    pub last_updated: Option<SystemTime>,
    /// Queued native value awaiting WRITE_NOTIFY.
    pub pending_write: Option<PvValue>,

    // Bookkeeping timestamps, reported by `Client::info`.
    pub connection_requested: SystemTime,
    pub last_connection_requested: SystemTime,
    pub connection_initiated: Option<Instant>,
    pub response_time: Option<SystemTime>,
    pub write_requested: Option<Instant>,
    pub write_sent: Option<Instant>,
    pub write_confirmed: Option<Instant>,

    // Monitor observers, preserved across reconnects.
    pub callbacks: Vec<Monitor>,
    pub writers: Vec<WriterFn>,
}

impl ClientPv {
    pub fn new(name: &str, channel_cid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.to_string(),
            channel_cid,
            server_addr: None,
            channel_sid: None,
            data_type: None,
            data_count: None,
            access_bits: None,
            subscription_id: None,
            ioid: 0,
            last_payload: None,
            last_updated: None,
            pending_write: None,
            connection_requested: now,
            last_connection_requested: now,
            connection_initiated: None,
            response_time: None,
            write_requested: None,
            write_sent: None,
            write_confirmed: None,
            callbacks: Vec::new(),
            writers: Vec::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        if self.server_addr.is_none() {
            ChannelState::Searching
        } else if self.channel_sid.is_none() {
            ChannelState::Connecting
        } else if self.subscription_id.is_none() {
            ChannelState::ChannelOpen
        } else {
            ChannelState::Subscribed
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel_sid.is_some()
    }

    /// Clear transient connection state after TCP loss. The name, the
    /// channel CID and the observer lists survive so a reconnect is
    /// transparent to monitors.
    pub fn reset(&mut self) {
        self.server_addr = None;
        self.channel_sid = None;
        self.data_type = None;
        self.data_count = None;
        self.access_bits = None;
        self.subscription_id = None;
        self.ioid = 0;
        self.last_payload = None;
        self.last_updated = None;
        self.connection_initiated = None;
        self.response_time = None;
        self.write_sent = None;
        self.write_confirmed = None;
    }

    /// Decode the most recent payload, if any.
    pub fn value(&self) -> Option<PvValue> {
        let payload = self.last_payload.as_ref()?;
        Some(crate::protocol::decode_value(
            self.data_type.unwrap_or(0),
            self.data_count.unwrap_or(1),
            payload,
        ))
    }
}
