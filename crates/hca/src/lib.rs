// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HCA - Channel Access for Rust
//!
//! A pure Rust implementation of the EPICS Channel Access (CA) protocol
//! v4.11 — the publish/subscribe RPC protocol industrial control systems
//! (accelerators, beamlines) use to expose named process variables (PVs)
//! over UDP discovery and TCP data channels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hca::{Client, Server, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     // Host a PV (IOC side)
//!     let server = Server::start()?;
//!     server.put("LAB:TEMP.VAL", 21.5)?;
//!
//!     // Read it back from anywhere on the subnet
//!     let client = Client::new()?;
//!     let value = client.get("LAB:TEMP.VAL", Some(Duration::from_secs(2)))?;
//!     println!("LAB:TEMP.VAL = {:?}", value);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |        Client (get/put/monitor)    Server (put/providers)          |
//! +--------------------------------------------------------------------+
//! |                          Engine Layer                              |
//! |  dispatcher (poll loop, sweeps)  |  handler threads, change sweep  |
//! +--------------------------------------------------------------------+
//! |                          Protocol Layer                            |
//! |   16-byte headers | 35 DBR types | payload codec | stream framing  |
//! +--------------------------------------------------------------------+
//! |                         Transport Layer                            |
//! |     UDP broadcast search | TCP channels | interface enumeration    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Connects, reads, writes and monitors remote PVs |
//! | [`Server`] | Hosts PVs and broadcasts updates to subscribers |
//! | [`PvValue`] | Native value: the seven CA bases, scalar or array |
//! | [`RecordProvider`] | Exports an object's fields under a name prefix |
//! | [`PvProperty`] | Exports one get/set closure pair as a PV |
//! | [`CaConfig`] | Ports, timeouts, search address list |
//!
//! ## Interoperability
//!
//! The wire format is byte-compatible with EPICS base v3.14+: big-endian
//! 16-byte headers, 8-byte payload padding, and the full 35-entry DBR
//! type table including the status/time/graphic/control metadata
//! variants. The standard `EPICS_CA_ADDR_LIST` and
//! `EPICS_CA_AUTO_ADDR_LIST` environment variables are honored.
//!
//! Out of scope: the repeater daemon (port 5065), beacons, IPv6, channel
//! priority arbitration, access-control lists, and emitting large-array
//! extended headers (they are decoded on receipt).

/// Runtime configuration (ports, timeouts, search address list).
pub mod config;
/// Public error type.
pub mod error;
/// Wire codec: headers, framing, DBR types, payload values.
pub mod protocol;
/// UDP/TCP plumbing and broadcast-address derivation.
pub mod transport;

/// Channel Access client engine.
pub mod client;
/// Channel Access server engine.
pub mod server;

pub use client::{ChannelState, Client, MonitorEvent, MonitorOptions, PvInfo};
pub use config::CaConfig;
pub use error::{Error, Result};
pub use protocol::{DbrBase, DbrScope, DbrType, PvValue};
pub use server::{Lookup, PvProperty, RecordProvider, Server};
