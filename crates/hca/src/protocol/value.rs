// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Native value representation and payload encoding/decoding.
//!
//! [`PvValue`] is the native-side view of a process variable: one of the
//! seven CA bases, scalar or array, plus an opaque fallback for unknown
//! wire types. [`encode_value`]/[`decode_value`] translate between native
//! values and the typed payloads of EVENT_ADD/READ_NOTIFY/WRITE_NOTIFY
//! messages, including the scope metadata headers.
//!
//! Decoding is deliberately tolerant: a declared element count larger than
//! the available payload is clamped, short payloads are zero-extended, and
//! unknown type codes come back as raw bytes. Encoding never fails either;
//! a value that cannot be represented in the requested base becomes the
//! base's zero value.

use super::constants::EPICS_EPOCH_OFFSET;
use super::cursor::{Cursor, CursorMut};
use super::types::{type_name, DbrBase, DbrScope, DbrType};
use super::{CaMessage, constants};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Digits reported in GR_/CTRL_ precision fields (what MEDM displays).
const DISPLAY_PRECISION: i16 = 8;

/// Native value of a process variable.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Str(String),
    Char(i8),
    Short(i16),
    Enum(i16),
    Float(f32),
    Long(i32),
    Double(f64),
    StrArray(Vec<String>),
    CharArray(Vec<i8>),
    ShortArray(Vec<i16>),
    EnumArray(Vec<i16>),
    FloatArray(Vec<f32>),
    LongArray(Vec<i32>),
    DoubleArray(Vec<f64>),
    /// Payload of a type code this implementation does not know.
    Raw(Vec<u8>),
}

impl PvValue {
    /// The CA base this value naturally maps to: string -> STRING,
    /// i8 -> CHAR, i16 -> SHORT, i32/i64/bool -> LONG, f32 -> FLOAT,
    /// f64 -> DOUBLE; arrays by their element.
    pub fn ca_base(&self) -> DbrBase {
        match self {
            PvValue::Str(_) | PvValue::StrArray(_) | PvValue::Raw(_) => DbrBase::String,
            PvValue::Char(_) | PvValue::CharArray(_) => DbrBase::Char,
            PvValue::Short(_) | PvValue::ShortArray(_) => DbrBase::Short,
            PvValue::Enum(_) | PvValue::EnumArray(_) => DbrBase::Enum,
            PvValue::Float(_) | PvValue::FloatArray(_) => DbrBase::Float,
            PvValue::Long(_) | PvValue::LongArray(_) => DbrBase::Long,
            PvValue::Double(_) | PvValue::DoubleArray(_) => DbrBase::Double,
        }
    }

    /// Element count as carried in the message header. A string counts as
    /// one element.
    pub fn ca_count(&self) -> u16 {
        let len = match self {
            PvValue::StrArray(v) => v.len(),
            PvValue::CharArray(v) => v.len(),
            PvValue::ShortArray(v) => v.len(),
            PvValue::EnumArray(v) => v.len(),
            PvValue::FloatArray(v) => v.len(),
            PvValue::LongArray(v) => v.len(),
            PvValue::DoubleArray(v) => v.len(),
            _ => 1,
        };
        len.min(u16::MAX as usize).max(1) as u16
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            PvValue::StrArray(_)
                | PvValue::CharArray(_)
                | PvValue::ShortArray(_)
                | PvValue::EnumArray(_)
                | PvValue::FloatArray(_)
                | PvValue::LongArray(_)
                | PvValue::DoubleArray(_)
        )
    }

    /// All elements as f64 (numeric view). Strings parse or become 0.
    pub(crate) fn numeric_elements(&self) -> Vec<f64> {
        fn parse(s: &str) -> f64 {
            s.trim().parse::<f64>().unwrap_or(0.0)
        }
        match self {
            PvValue::Str(s) => vec![parse(s)],
            PvValue::StrArray(v) => v.iter().map(|s| parse(s)).collect(),
            PvValue::Char(v) => vec![f64::from(*v)],
            PvValue::CharArray(v) => v.iter().map(|x| f64::from(*x)).collect(),
            PvValue::Short(v) => vec![f64::from(*v)],
            PvValue::ShortArray(v) => v.iter().map(|x| f64::from(*x)).collect(),
            PvValue::Enum(v) => vec![f64::from(*v)],
            PvValue::EnumArray(v) => v.iter().map(|x| f64::from(*x)).collect(),
            PvValue::Float(v) => vec![f64::from(*v)],
            PvValue::FloatArray(v) => v.iter().map(|x| f64::from(*x)).collect(),
            PvValue::Long(v) => vec![f64::from(*v)],
            PvValue::LongArray(v) => v.iter().map(|x| f64::from(*x)).collect(),
            PvValue::Double(v) => vec![*v],
            PvValue::DoubleArray(v) => v.clone(),
            PvValue::Raw(_) => vec![0.0],
        }
    }

    /// All elements as display strings.
    pub(crate) fn string_elements(&self) -> Vec<String> {
        match self {
            PvValue::Str(s) => vec![s.clone()],
            PvValue::StrArray(v) => v.clone(),
            PvValue::Char(v) => vec![v.to_string()],
            PvValue::CharArray(v) => v.iter().map(ToString::to_string).collect(),
            PvValue::Short(v) => vec![v.to_string()],
            PvValue::ShortArray(v) => v.iter().map(ToString::to_string).collect(),
            PvValue::Enum(v) => vec![v.to_string()],
            PvValue::EnumArray(v) => v.iter().map(ToString::to_string).collect(),
            PvValue::Float(v) => vec![v.to_string()],
            PvValue::FloatArray(v) => v.iter().map(ToString::to_string).collect(),
            PvValue::Long(v) => vec![v.to_string()],
            PvValue::LongArray(v) => v.iter().map(ToString::to_string).collect(),
            PvValue::Double(v) => vec![v.to_string()],
            PvValue::DoubleArray(v) => v.iter().map(ToString::to_string).collect(),
            PvValue::Raw(bytes) => vec![String::from_utf8_lossy(bytes).into_owned()],
        }
    }

    /// Wire-form identity used for change detection: plain-base type code,
    /// element count, and the plain encoding. Comparing in wire form (not
    /// native form) means e.g. `1i32` and `1.0f64` are different values.
    pub fn fingerprint(&self) -> (u16, u16, Vec<u8>) {
        let dtype = DbrType::plain(self.ca_base());
        (dtype.code(), self.ca_count(), encode_value(self, dtype))
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_array() {
            write!(f, "[{}]", self.string_elements().join(", "))
        } else {
            write!(f, "{}", self.string_elements().concat())
        }
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Str(v.to_string())
    }
}
impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Str(v)
    }
}
impl From<bool> for PvValue {
    fn from(v: bool) -> Self {
        PvValue::Long(i32::from(v))
    }
}
impl From<i8> for PvValue {
    fn from(v: i8) -> Self {
        PvValue::Char(v)
    }
}
impl From<i16> for PvValue {
    fn from(v: i16) -> Self {
        PvValue::Short(v)
    }
}
impl From<i32> for PvValue {
    fn from(v: i32) -> Self {
        PvValue::Long(v)
    }
}
impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Long(v as i32)
    }
}
impl From<f32> for PvValue {
    fn from(v: f32) -> Self {
        PvValue::Float(v)
    }
}
impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Double(v)
    }
}
impl From<Vec<String>> for PvValue {
    fn from(v: Vec<String>) -> Self {
        PvValue::StrArray(v)
    }
}
impl From<Vec<i8>> for PvValue {
    fn from(v: Vec<i8>) -> Self {
        PvValue::CharArray(v)
    }
}
impl From<Vec<i16>> for PvValue {
    fn from(v: Vec<i16>) -> Self {
        PvValue::ShortArray(v)
    }
}
impl From<Vec<i32>> for PvValue {
    fn from(v: Vec<i32>) -> Self {
        PvValue::LongArray(v)
    }
}
impl From<Vec<f32>> for PvValue {
    fn from(v: Vec<f32>) -> Self {
        PvValue::FloatArray(v)
    }
}
impl From<Vec<f64>> for PvValue {
    fn from(v: Vec<f64>) -> Self {
        PvValue::DoubleArray(v)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a native value as the payload of the given wire type: scope
/// metadata header first, then the element data. Never fails; values that
/// do not fit the base become the base's zero value.
pub fn encode_value(value: &PvValue, dtype: DbrType) -> Vec<u8> {
    let mut payload = vec![0u8; dtype.meta_size()];
    encode_meta(&mut payload, dtype);
    encode_elements(&mut payload, value, dtype.base);
    payload
}

/// Fill in the non-zero fields of the scope metadata header. The buffer is
/// pre-zeroed, so padding, units and limits are already in place.
fn encode_meta(buf: &mut [u8], dtype: DbrType) {
    if dtype.scope == DbrScope::Plain {
        return;
    }
    let mut w = CursorMut::new(buf);
    // status = 0 (normal), severity = 1 (success); buffer is header-sized.
    let _ = w.write_u16(0);
    let _ = w.write_u16(1);
    match dtype.scope {
        DbrScope::Time => {
            let (seconds, nanoseconds) = epics_now();
            let _ = w.write_u32(seconds);
            let _ = w.write_u32(nanoseconds);
        }
        DbrScope::Gr | DbrScope::Ctrl => {
            if matches!(dtype.base, DbrBase::Float | DbrBase::Double) {
                let _ = w.write_i16(DISPLAY_PRECISION);
            }
        }
        _ => {}
    }
}

/// Current time as (seconds since 1990-01-01, nanoseconds).
fn epics_now() -> (u32, u32) {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let seconds = since_unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET);
    (seconds.min(u64::from(u32::MAX)) as u32, since_unix.subsec_nanos())
}

fn encode_elements(payload: &mut Vec<u8>, value: &PvValue, base: DbrBase) {
    if let PvValue::Raw(bytes) = value {
        payload.extend_from_slice(bytes);
        return;
    }
    match base {
        DbrBase::String => {
            // Null-separated concatenation; message padding supplies the
            // final terminator.
            let joined = value.string_elements().join("\0");
            payload.extend_from_slice(joined.as_bytes());
        }
        DbrBase::Char => {
            for v in value.numeric_elements() {
                payload.push((v as i8) as u8);
            }
        }
        DbrBase::Short | DbrBase::Enum => {
            for v in value.numeric_elements() {
                payload.extend_from_slice(&(v as i16).to_be_bytes());
            }
        }
        DbrBase::Float => {
            for v in value.numeric_elements() {
                payload.extend_from_slice(&(v as f32).to_be_bytes());
            }
        }
        DbrBase::Long => {
            for v in value.numeric_elements() {
                payload.extend_from_slice(&(v as i32).to_be_bytes());
            }
        }
        DbrBase::Double => {
            for v in value.numeric_elements() {
                payload.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a typed payload into a native value.
///
/// `type_code`/`data_count` come straight from the message header.
/// Unknown type codes decode as [`PvValue::Raw`]; counts beyond the
/// available bytes are clamped; short payloads are zero-extended. A count
/// of one yields a scalar.
pub fn decode_value(type_code: u16, data_count: u16, payload: &[u8]) -> PvValue {
    let Some(dtype) = DbrType::from_code(type_code) else {
        log::debug!("[codec] unknown type code {}, keeping raw payload", type_code);
        return PvValue::Raw(payload.to_vec());
    };
    let data = payload.get(dtype.meta_size()..).unwrap_or(&[]);

    if dtype.base == DbrBase::String {
        let mut strings: Vec<String> = data
            .split(|b| *b == 0)
            .take(data_count.max(1) as usize)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();
        return if strings.len() == 1 {
            PvValue::Str(strings.remove(0))
        } else {
            PvValue::StrArray(strings)
        };
    }

    let elem = dtype.base.element_size();
    let available = data.len() / elem;
    let count = if data_count as usize > available {
        available.max(1)
    } else {
        data_count as usize
    };

    // Zero-extend so a clamped-to-one empty payload still decodes.
    let mut buf = vec![0u8; count * elem];
    let copy = data.len().min(buf.len());
    buf[..copy].copy_from_slice(&data[..copy]);
    let mut r = Cursor::new(&buf);

    // Cursor reads over a correctly sized local buffer cannot fail.
    match dtype.base {
        DbrBase::Char => {
            let v: Vec<i8> = (0..count).map(|_| r.read_i8().unwrap_or(0)).collect();
            scalar_or_array(v, PvValue::Char, PvValue::CharArray)
        }
        DbrBase::Short => {
            let v: Vec<i16> = (0..count).map(|_| r.read_i16().unwrap_or(0)).collect();
            scalar_or_array(v, PvValue::Short, PvValue::ShortArray)
        }
        DbrBase::Enum => {
            let v: Vec<i16> = (0..count).map(|_| r.read_i16().unwrap_or(0)).collect();
            scalar_or_array(v, PvValue::Enum, PvValue::EnumArray)
        }
        DbrBase::Float => {
            let v: Vec<f32> = (0..count).map(|_| r.read_f32().unwrap_or(0.0)).collect();
            scalar_or_array(v, PvValue::Float, PvValue::FloatArray)
        }
        DbrBase::Long => {
            let v: Vec<i32> = (0..count).map(|_| r.read_i32().unwrap_or(0)).collect();
            scalar_or_array(v, PvValue::Long, PvValue::LongArray)
        }
        DbrBase::Double => {
            let v: Vec<f64> = (0..count).map(|_| r.read_f64().unwrap_or(0.0)).collect();
            scalar_or_array(v, PvValue::Double, PvValue::DoubleArray)
        }
        DbrBase::String => unreachable!("handled above"),
    }
}

fn scalar_or_array<T>(
    mut items: Vec<T>,
    scalar: impl Fn(T) -> PvValue,
    array: impl Fn(Vec<T>) -> PvValue,
) -> PvValue {
    if items.len() == 1 {
        scalar(items.remove(0))
    } else {
        array(items)
    }
}

/// Extract the server timestamp from a TIME_-scoped payload as Unix time.
/// Non-TIME scopes and short payloads return `None`.
pub fn decode_timestamp(type_code: u16, payload: &[u8]) -> Option<SystemTime> {
    let dtype = DbrType::from_code(type_code)?;
    if dtype.scope != DbrScope::Time || payload.len() < 12 {
        return None;
    }
    let mut r = Cursor::new(payload);
    let _status = r.read_u16().ok()?;
    let _severity = r.read_u16().ok()?;
    let seconds = r.read_u32().ok()?;
    let nanoseconds = r.read_u32().ok()?;
    Some(
        UNIX_EPOCH
            + Duration::from_secs(u64::from(seconds) + EPICS_EPOCH_OFFSET)
            + Duration::from_nanos(u64::from(nanoseconds)),
    )
}

/// One-line diagnostic rendering of a message, used by debug logging.
pub fn describe(message: &CaMessage) -> String {
    let h = &message.header;
    let mut s = format!(
        "{}({}),{},{}({}),{}, {}, {}",
        h.command,
        constants::command_name(h.command),
        h.payload_size,
        h.data_type,
        type_name(h.data_type),
        h.data_count,
        h.parameter1,
        h.parameter2
    );
    if !message.payload.is_empty()
        && matches!(
            h.command,
            constants::CMD_EVENT_ADD
                | constants::CMD_WRITE
                | constants::CMD_READ_NOTIFY
                | constants::CMD_WRITE_NOTIFY
        )
    {
        s.push_str(&format!(
            ", ({})",
            decode_value(h.data_type, h.data_count, &message.payload)
        ));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: PvValue, scope: DbrScope) -> PvValue {
        let dtype = DbrType::new(scope, value.ca_base());
        let payload = encode_value(&value, dtype);
        decode_value(dtype.code(), value.ca_count(), &payload)
    }

    #[test]
    fn test_scalar_roundtrip_all_scopes() {
        let scopes = [
            DbrScope::Plain,
            DbrScope::Sts,
            DbrScope::Time,
            DbrScope::Gr,
            DbrScope::Ctrl,
        ];
        for scope in scopes {
            assert_eq!(roundtrip(PvValue::Str("hello".into()), scope), PvValue::Str("hello".into()));
            assert_eq!(roundtrip(PvValue::Char(-5), scope), PvValue::Char(-5));
            assert_eq!(roundtrip(PvValue::Short(-1234), scope), PvValue::Short(-1234));
            assert_eq!(roundtrip(PvValue::Enum(3), scope), PvValue::Enum(3));
            assert_eq!(roundtrip(PvValue::Float(2.5), scope), PvValue::Float(2.5));
            assert_eq!(roundtrip(PvValue::Long(-70_000), scope), PvValue::Long(-70_000));
            assert_eq!(roundtrip(PvValue::Double(3.25), scope), PvValue::Double(3.25));
        }
    }

    #[test]
    fn test_array_roundtrip() {
        let value = PvValue::DoubleArray(vec![1.0, 2.0, 3.0]);
        assert_eq!(roundtrip(value.clone(), DbrScope::Plain), value);
        assert_eq!(roundtrip(value.clone(), DbrScope::Time), value);

        let value = PvValue::LongArray(vec![-1, 0, 7]);
        assert_eq!(roundtrip(value.clone(), DbrScope::Ctrl), value);

        let value = PvValue::StrArray(vec!["a".into(), "bc".into()]);
        assert_eq!(roundtrip(value.clone(), DbrScope::Plain), value);
    }

    #[test]
    fn test_decode_count_clamped_to_payload() {
        // Declared count of 100 over 8 bytes of DOUBLE data yields one
        // element, never an error.
        let payload = encode_value(&PvValue::Double(1.5), DbrType::plain(DbrBase::Double));
        assert_eq!(decode_value(6, 100, &payload), PvValue::Double(1.5));
    }

    #[test]
    fn test_decode_empty_payload() {
        assert_eq!(decode_value(6, 1, &[]), PvValue::Double(0.0));
        assert_eq!(decode_value(5, 3, &[]), PvValue::Long(0));
    }

    #[test]
    fn test_decode_unknown_type_code_is_opaque() {
        let bytes = vec![1, 2, 3, 4];
        assert_eq!(decode_value(99, 1, &bytes), PvValue::Raw(bytes));
    }

    #[test]
    fn test_zero_substitution_on_bad_conversion() {
        // A non-numeric string written as LONG becomes 0.
        let payload = encode_value(&PvValue::Str("abc".into()), DbrType::plain(DbrBase::Long));
        assert_eq!(decode_value(5, 1, &payload), PvValue::Long(0));
        // A numeric string converts.
        let payload = encode_value(&PvValue::Str("42".into()), DbrType::plain(DbrBase::Long));
        assert_eq!(decode_value(5, 1, &payload), PvValue::Long(42));
    }

    #[test]
    fn test_time_meta_header_layout() {
        let dtype = DbrType::new(DbrScope::Time, DbrBase::Double);
        let payload = encode_value(&PvValue::Double(0.0), dtype);
        // status, severity
        assert_eq!(&payload[0..2], &[0, 0]);
        assert_eq!(&payload[2..4], &[0, 1]);
        // 4-byte alignment pad before the element data
        assert_eq!(&payload[12..16], &[0, 0, 0, 0]);
        assert_eq!(payload.len(), 16 + 8);
        let stamp = decode_timestamp(dtype.code(), &payload).expect("TIME_ carries a stamp");
        let age = SystemTime::now()
            .duration_since(stamp)
            .unwrap_or(Duration::ZERO);
        assert!(age < Duration::from_secs(5), "timestamp must be current");
    }

    #[test]
    fn test_timestamp_absent_for_plain() {
        let payload = encode_value(&PvValue::Double(0.0), DbrType::plain(DbrBase::Double));
        assert!(decode_timestamp(6, &payload).is_none());
    }

    #[test]
    fn test_ctrl_double_precision_field() {
        let dtype = DbrType::new(DbrScope::Ctrl, DbrBase::Double);
        let payload = encode_value(&PvValue::Double(1.0), dtype);
        // status(2) severity(2) then precision i16
        assert_eq!(&payload[4..6], &8i16.to_be_bytes());
        assert_eq!(payload.len(), dtype.meta_size() + 8);
    }

    #[test]
    fn test_native_type_mapping() {
        assert_eq!(PvValue::from(true), PvValue::Long(1));
        assert_eq!(PvValue::from(7i64), PvValue::Long(7));
        assert_eq!(PvValue::from(7i32).ca_base(), DbrBase::Long);
        assert_eq!(PvValue::from(7i16).ca_base(), DbrBase::Short);
        assert_eq!(PvValue::from(7i8).ca_base(), DbrBase::Char);
        assert_eq!(PvValue::from(1.5f32).ca_base(), DbrBase::Float);
        assert_eq!(PvValue::from(1.5f64).ca_base(), DbrBase::Double);
        assert_eq!(PvValue::from("x").ca_base(), DbrBase::String);
        assert_eq!(PvValue::from(vec![1.0f64, 2.0]).ca_count(), 2);
    }

    #[test]
    fn test_fingerprint_distinguishes_types() {
        // Same numeric value, different wire identity.
        assert_ne!(PvValue::Long(1).fingerprint(), PvValue::Double(1.0).fingerprint());
        assert_eq!(PvValue::Long(1).fingerprint(), PvValue::Long(1).fingerprint());
        assert_ne!(PvValue::Long(1).fingerprint(), PvValue::Long(2).fingerprint());
    }

    #[test]
    fn test_describe_mentions_command_and_value() {
        let payload = encode_value(&PvValue::Long(7), DbrType::plain(DbrBase::Long));
        let message = CaMessage::new(constants::CMD_EVENT_ADD, 5, 1, 1, 12, payload);
        let text = describe(&message);
        assert!(text.contains("EVENT_ADD"), "{}", text);
        assert!(text.contains("LONG"), "{}", text);
        assert!(text.contains('7'), "{}", text);
    }
}
