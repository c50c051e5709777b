// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network plumbing shared by the client and server engines:
//! interface/broadcast enumeration and UDP socket construction.

pub mod addr;
pub mod udp;

pub use addr::{broadcast_address, search_targets, IfaceAddr};
pub use udp::{discovery_socket, search_socket};
