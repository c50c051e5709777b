// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CA message header encoding/decoding and stream framing.
//!
//! Every CA message is a fixed 16-byte big-endian header followed by a
//! payload zero-padded to a multiple of 8 bytes:
//!
//! ```text
//! +---------+--------------+-----------+------------+--------+--------+
//! | command | payload_size | data_type | data_count | param1 | param2 |
//! |   u16   |     u16      |    u16    |    u16     |  u32   |  u32   |
//! +---------+--------------+-----------+------------+--------+--------+
//! | payload (payload_size bytes, already 8-byte aligned on emit)      |
//! +-------------------------------------------------------------------+
//! ```
//!
//! TCP is a stream protocol without message boundaries; [`FrameBuffer`]
//! accumulates received bytes and yields exactly-delimited messages
//! regardless of segmentation. UDP datagrams may carry several
//! concatenated messages; [`split_datagram`] breaks them up.
//!
//! The extended header form (`payload_size == 0xFFFF`, with a u32 size and
//! u32 count prepended to the payload) is decoded for interoperability with
//! large-array IOCs but never emitted.

use super::constants::{EXTENDED_PAYLOAD_MARKER, HEADER_SIZE};
use super::cursor::{Cursor, CursorMut};
use super::{aligned, WireError, WireResult};

/// Extended header adds two u32 fields after the fixed 16 bytes.
const EXTENDED_HEADER_SIZE: usize = HEADER_SIZE + 8;

/// The six fixed header fields of a CA message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaHeader {
    pub command: u16,
    pub payload_size: u16,
    pub data_type: u16,
    pub data_count: u16,
    pub parameter1: u32,
    pub parameter2: u32,
}

impl CaHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut w = CursorMut::new(&mut buf);
        // Infallible: the buffer is exactly header-sized.
        let _ = w.write_u16(self.command);
        let _ = w.write_u16(self.payload_size);
        let _ = w.write_u16(self.data_type);
        let _ = w.write_u16(self.data_count);
        let _ = w.write_u32(self.parameter1);
        let _ = w.write_u32(self.parameter2);
        buf
    }

    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::DecodeFailed {
                reason: format!("truncated header: {} bytes", bytes.len()),
            });
        }
        let mut r = Cursor::new(bytes);
        Ok(Self {
            command: r.read_u16()?,
            payload_size: r.read_u16()?,
            data_type: r.read_u16()?,
            data_count: r.read_u16()?,
            parameter1: r.read_u32()?,
            parameter2: r.read_u32()?,
        })
    }
}

/// A complete CA message: header plus (padded) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMessage {
    pub header: CaHeader,
    pub payload: Vec<u8>,
}

impl CaMessage {
    /// Build a message; the payload is zero-padded to 8 bytes and
    /// `payload_size` reflects the padded length.
    pub fn new(
        command: u16,
        data_type: u16,
        data_count: u16,
        parameter1: u32,
        parameter2: u32,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let mut payload = payload.into();
        let padded = aligned(payload.len());
        debug_assert!(padded <= u16::MAX as usize, "oversized payload");
        payload.resize(padded, 0);
        Self {
            header: CaHeader {
                command,
                payload_size: padded as u16,
                data_type,
                data_count,
                parameter1,
                parameter2,
            },
            payload,
        }
    }

    /// Header-only message (empty payload).
    pub fn bare(
        command: u16,
        data_type: u16,
        data_count: u16,
        parameter1: u32,
        parameter2: u32,
    ) -> Self {
        Self::new(command, data_type, data_count, parameter1, parameter2, Vec::new())
    }

    /// Serialize to wire bytes. Emitted frames always satisfy
    /// `len % 8 == 0 && len >= 16`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Total wire length of this message.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Incremental frame decoder for TCP streams.
///
/// Append received bytes with [`push`](Self::push) and drain complete
/// messages with [`next_message`](Self::next_message); partial frames stay
/// buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Option<CaMessage> {
        let (message, consumed) = decode_frame(&self.buffer)?;
        self.buffer.drain(..consumed);
        Some(message)
    }
}

/// Decode one frame from the front of `data`. Returns the message and the
/// number of bytes consumed, or `None` if the frame is still incomplete.
fn decode_frame(data: &[u8]) -> Option<(CaMessage, usize)> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let mut header = match CaHeader::decode(data) {
        Ok(h) => h,
        Err(_) => return None,
    };

    let (payload_len, payload_start) = if header.payload_size == EXTENDED_PAYLOAD_MARKER {
        // Large-array form: real size/count follow as two u32s.
        if data.len() < EXTENDED_HEADER_SIZE {
            return None;
        }
        let mut r = Cursor::new(&data[HEADER_SIZE..EXTENDED_HEADER_SIZE]);
        let size = r.read_u32().ok()? as usize;
        let count = r.read_u32().ok()?;
        header.payload_size = 0; // no longer meaningful; length tracked below
        header.data_count = count.min(u32::from(u16::MAX)) as u16;
        (aligned(size), EXTENDED_HEADER_SIZE)
    } else {
        (aligned(header.payload_size as usize), HEADER_SIZE)
    };

    let total = payload_start + payload_len;
    if data.len() < total {
        return None;
    }
    let payload = data[payload_start..total].to_vec();
    if payload_start == HEADER_SIZE {
        header.payload_size = payload.len() as u16;
    }
    Some((CaMessage { header, payload }, total))
}

/// Split a UDP datagram into the messages it carries.
///
/// Trailing bytes that do not form a complete message are dropped (logged),
/// matching the decoder-tolerance rule: a malformed datagram never fails the
/// engine.
pub fn split_datagram(data: &[u8]) -> Vec<CaMessage> {
    let mut messages = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        match decode_frame(rest) {
            Some((message, consumed)) => {
                rest = &rest[consumed..];
                messages.push(message);
            }
            None => {
                log::debug!(
                    "[codec] dropping {} trailing datagram bytes (incomplete frame)",
                    rest.len()
                );
                break;
            }
        }
    }
    messages
}
