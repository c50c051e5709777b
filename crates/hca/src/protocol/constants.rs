// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel Access protocol constants (CA v4.11).
//!
//! Centralizes all CA command codes, status codes, monitor mask bits and
//! protocol-level magic numbers so the rest of the crate never spells a raw
//! wire value.
//!
//! The command table below is the complete v4.11 set. Commands this
//! implementation does not originate (SNAPSHOT, BUILD, the EVENTS_* pair,
//! READ_SYNC, ERROR, RSRV_IS_UP, SIGNAL) are still named so received frames
//! can be logged meaningfully.

/// CA protocol major version.
pub const MAJOR_VERSION: u16 = 4;

/// CA protocol minor version.
pub const MINOR_VERSION: u16 = 11;

/// Default CA server port: 5056 + major_version * 2 = 5064 (TCP and UDP).
pub const CA_SERVER_PORT: u16 = 5056 + MAJOR_VERSION * 2;

/// CA repeater port (5065). Named for completeness; the repeater protocol
/// is not implemented.
pub const CA_REPEATER_PORT: u16 = CA_SERVER_PORT + 1;

/// Fixed CA message header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Payloads are zero-padded to multiples of this on the wire.
pub const PAYLOAD_ALIGNMENT: usize = 8;

/// `payload_size` sentinel announcing the extended (large-array) header.
pub const EXTENDED_PAYLOAD_MARKER: u16 = 0xFFFF;

/// Seconds between the Unix epoch (1970-01-01) and the EPICS epoch
/// (1990-01-01), used by TIME_* payload headers.
pub const EPICS_EPOCH_OFFSET: u64 = 631_152_000;

// ============================================================================
// Command codes (CA v4.11 Sec.6)
// ============================================================================

pub const CMD_VERSION: u16 = 0;
pub const CMD_EVENT_ADD: u16 = 1;
pub const CMD_EVENT_CANCEL: u16 = 2;
pub const CMD_READ: u16 = 3;
pub const CMD_WRITE: u16 = 4;
pub const CMD_SNAPSHOT: u16 = 5;
pub const CMD_SEARCH: u16 = 6;
pub const CMD_BUILD: u16 = 7;
pub const CMD_EVENTS_OFF: u16 = 8;
pub const CMD_EVENTS_ON: u16 = 9;
pub const CMD_READ_SYNC: u16 = 10;
pub const CMD_ERROR: u16 = 11;
pub const CMD_CLEAR_CHANNEL: u16 = 12;
pub const CMD_RSRV_IS_UP: u16 = 13;
pub const CMD_NOT_FOUND: u16 = 14;
pub const CMD_READ_NOTIFY: u16 = 15;
pub const CMD_READ_BUILD: u16 = 16;
pub const CMD_CREATE_CHAN: u16 = 18;
pub const CMD_WRITE_NOTIFY: u16 = 19;
pub const CMD_CLIENT_NAME: u16 = 20;
pub const CMD_HOST_NAME: u16 = 21;
pub const CMD_ACCESS_RIGHTS: u16 = 22;
pub const CMD_ECHO: u16 = 23;
pub const CMD_SIGNAL: u16 = 25;
pub const CMD_CREATE_CH_FAIL: u16 = 26;
pub const CMD_SERVER_DISCONN: u16 = 27;

/// Human-readable command name for diagnostics.
pub fn command_name(command: u16) -> &'static str {
    match command {
        CMD_VERSION => "VERSION",
        CMD_EVENT_ADD => "EVENT_ADD",
        CMD_EVENT_CANCEL => "EVENT_CANCEL",
        CMD_READ => "READ",
        CMD_WRITE => "WRITE",
        CMD_SNAPSHOT => "SNAPSHOT",
        CMD_SEARCH => "SEARCH",
        CMD_BUILD => "BUILD",
        CMD_EVENTS_OFF => "EVENTS_OFF",
        CMD_EVENTS_ON => "EVENTS_ON",
        CMD_READ_SYNC => "READ_SYNC",
        CMD_ERROR => "ERROR",
        CMD_CLEAR_CHANNEL => "CLEAR_CHANNEL",
        CMD_RSRV_IS_UP => "RSRV_IS_UP",
        CMD_NOT_FOUND => "NOT_FOUND",
        CMD_READ_NOTIFY => "READ_NOTIFY",
        CMD_READ_BUILD => "READ_BUILD",
        CMD_CREATE_CHAN => "CREATE_CHAN",
        CMD_WRITE_NOTIFY => "WRITE_NOTIFY",
        CMD_CLIENT_NAME => "CLIENT_NAME",
        CMD_HOST_NAME => "HOST_NAME",
        CMD_ACCESS_RIGHTS => "ACCESS_RIGHTS",
        CMD_ECHO => "ECHO",
        CMD_SIGNAL => "SIGNAL",
        CMD_CREATE_CH_FAIL => "CREATE_CH_FAIL",
        CMD_SERVER_DISCONN => "SERVER_DISCONN",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// Monitor mask bits (EVENT_ADD payload)
// ============================================================================

/// Value change events are reported.
pub const MASK_VALUE: u16 = 0x01;

/// Log events are reported (different dead band than VALUE).
pub const MASK_LOG: u16 = 0x02;

/// Alarm events are reported.
pub const MASK_ALARM: u16 = 0x04;

/// Default subscription mask: VALUE | LOG | ALARM.
pub const MASK_DEFAULT: u16 = MASK_VALUE | MASK_LOG | MASK_ALARM;

// ============================================================================
// SEARCH reply flags (SEARCH request data_type field)
// ============================================================================

/// Server must not answer a failed search.
pub const SEARCH_NO_REPLY: u16 = 5;

/// Server answers NOT_FOUND on a failed search.
pub const SEARCH_DO_REPLY: u16 = 10;

/// SEARCH reply `parameter1` placeholder ("temporary SID").
pub const SEARCH_REPLY_SID: u32 = 0xFFFF_FFFF;

// ============================================================================
// Status codes (subset of the ECA_* table that appears on the wire)
// ============================================================================

/// Normal successful completion. The full ECA encoding is
/// `(code << 3) | severity`; ECA_NORMAL is code 0, severity SUCCESS (1).
pub const ECA_NORMAL: u32 = 1;

/// Channel write request failed: code PUTFAIL (20), severity ERROR (2).
pub const ECA_PUTFAIL: u32 = (20 << 3) | 2;

// ============================================================================
// Access rights bits (ACCESS_RIGHTS parameter2)
// ============================================================================

pub const ACCESS_READ: u32 = 0x01;
pub const ACCESS_WRITE: u32 = 0x02;

/// VERSION greeting priority sent by the client.
pub const CLIENT_PRIORITY: u16 = 10;
