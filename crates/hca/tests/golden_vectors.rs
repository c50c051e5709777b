// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-exact wire vectors.
//!
//! CA interoperates with EPICS base v3.14+, so these frames are pinned to
//! the exact bytes a reference IOC produces. Any codec change that breaks
//! one of these breaks real-world interop, whatever the round-trip tests
//! say.

use hca::protocol::constants::{
    CMD_CLIENT_NAME, CMD_SEARCH, CMD_VERSION, MINOR_VERSION, SEARCH_REPLY_SID,
};
use hca::protocol::{encode_value, CaMessage, DbrBase, DbrScope, DbrType};
use hca::PvValue;

#[test]
fn search_request_frame() {
    let mut payload = b"TEST:A.VAL".to_vec();
    payload.push(0);
    let message = CaMessage::new(CMD_SEARCH, 5, MINOR_VERSION, 1, 1, payload);
    let wire = message.encode();

    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        0x00, 0x06, // command SEARCH
        0x00, 0x10, // payload size 16 (11 bytes name+NUL, padded)
        0x00, 0x05, // reply flag: no reply on failure
        0x00, 0x0B, // minor version 11
        0x00, 0x00, 0x00, 0x01, // cid
        0x00, 0x00, 0x00, 0x01, // cid
        b'T', b'E', b'S', b'T', b':', b'A', b'.', b'V', b'A', b'L', 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, // padding
    ];
    assert_eq!(wire, expected);
}

#[test]
fn search_reply_frame() {
    // The server answers with its TCP port in data_type and the sentinel
    // "temporary SID" in parameter1; payload is the minor version as a
    // big-endian i16 padded to 8.
    let payload = encode_value(
        &PvValue::Short(MINOR_VERSION as i16),
        DbrType::plain(DbrBase::Short),
    );
    let message = CaMessage::new(CMD_SEARCH, 5064, 0, SEARCH_REPLY_SID, 7, payload);
    let wire = message.encode();

    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        0x00, 0x06, // command SEARCH
        0x00, 0x08, // payload size 8
        0x13, 0xC8, // TCP port 5064
        0x00, 0x00,
        0xFF, 0xFF, 0xFF, 0xFF, // temporary SID
        0x00, 0x00, 0x00, 0x07, // echoed cid
        0x00, 0x0B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // minor 11, padded
    ];
    assert_eq!(wire, expected);
}

#[test]
fn version_greeting_frame() {
    let message = CaMessage::bare(CMD_VERSION, 10, MINOR_VERSION, 0, 0);
    assert_eq!(
        message.encode(),
        vec![0, 0, 0, 0, 0, 10, 0, 11, 0, 0, 0, 0, 0, 0, 0, 0]
    );
}

#[test]
fn client_name_frame() {
    let message = CaMessage::new(CMD_CLIENT_NAME, 0, 0, 0, 0, b"op\0".to_vec());
    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        0x00, 0x14, // command CLIENT_NAME
        0x00, 0x08, // payload size 8
        0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        b'o', b'p', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(message.encode(), expected);
}

#[test]
fn sts_long_payload() {
    // STS_ header: status 0, severity 1 (success), then the i32 element.
    let payload = encode_value(&PvValue::Long(7), DbrType::new(DbrScope::Sts, DbrBase::Long));
    assert_eq!(payload, vec![0, 0, 0, 1, 0, 0, 0, 7]);
}

#[test]
fn sts_double_alignment_padding() {
    // STS_DOUBLE carries 4 bytes of struct padding before the element.
    let payload = encode_value(
        &PvValue::Double(1.0),
        DbrType::new(DbrScope::Sts, DbrBase::Double),
    );
    assert_eq!(payload.len(), 8 + 8);
    assert_eq!(&payload[0..4], &[0, 0, 0, 1]);
    assert_eq!(&payload[4..8], &[0, 0, 0, 0]); // alignment pad
    assert_eq!(&payload[8..16], &1.0f64.to_be_bytes());
}

#[test]
fn ctrl_float_header_layout() {
    // status(2) severity(2) precision(2) pad(2) unit(8) 8 limits x f32.
    let dtype = DbrType::new(DbrScope::Ctrl, DbrBase::Float);
    let payload = encode_value(&PvValue::Float(2.5), dtype);
    assert_eq!(payload.len(), dtype.meta_size() + 4);
    assert_eq!(&payload[0..4], &[0, 0, 0, 1]);
    assert_eq!(&payload[4..6], &8i16.to_be_bytes()); // display precision
    assert!(payload[6..48].iter().all(|b| *b == 0)); // pad, unit, limits
    assert_eq!(&payload[48..52], &2.5f32.to_be_bytes());
}

#[test]
fn gr_enum_state_string_block() {
    // GR_ENUM: status/severity, nstrings i16, 16 x 26-byte strings.
    let dtype = DbrType::new(DbrScope::Gr, DbrBase::Enum);
    let payload = encode_value(&PvValue::Enum(2), dtype);
    assert_eq!(payload.len(), 4 + 2 + 416 + 2);
    assert_eq!(&payload[payload.len() - 2..], &2i16.to_be_bytes());
}

#[test]
fn double_array_payload() {
    let payload = encode_value(
        &PvValue::DoubleArray(vec![1.0, 2.0, 3.0]),
        DbrType::plain(DbrBase::Double),
    );
    let mut expected = Vec::new();
    expected.extend_from_slice(&1.0f64.to_be_bytes());
    expected.extend_from_slice(&2.0f64.to_be_bytes());
    expected.extend_from_slice(&3.0f64.to_be_bytes());
    assert_eq!(payload, expected);
}
