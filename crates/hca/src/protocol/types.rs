// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The CA payload data type table.
//!
//! CA defines 35 type codes (0..=34) laid out as `scope_offset + base_index`:
//! five scopes (plain, STS_, TIME_, GR_, CTRL_) over seven bases (STRING,
//! SHORT, FLOAT, ENUM, CHAR, LONG, DOUBLE). Every non-plain scope prepends a
//! fixed-size metadata header to the payload whose size depends on both the
//! scope and the base, including alignment padding quirks inherited from the
//! C `db_access.h` structs.

use std::fmt;

/// Limit-block element count for GR_ scope (lo/hi display, lo/hi alarm,
/// lo/hi warn).
const GR_LIMITS: usize = 6;

/// Limit-block element count for CTRL_ scope (GR_ limits plus lo/hi
/// control).
const CTRL_LIMITS: usize = 8;

/// Unit string field width in GR_/CTRL_ headers.
const UNIT_SIZE: usize = 8;

/// ENUM state-string block: 16 strings of 26 bytes each.
const ENUM_STRINGS_SIZE: usize = 16 * 26;

/// Element base type (the seven CA primitive kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbrBase {
    String = 0,
    Short = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrBase {
    pub fn from_index(index: u16) -> Option<Self> {
        match index {
            0 => Some(DbrBase::String),
            1 => Some(DbrBase::Short),
            2 => Some(DbrBase::Float),
            3 => Some(DbrBase::Enum),
            4 => Some(DbrBase::Char),
            5 => Some(DbrBase::Long),
            6 => Some(DbrBase::Double),
            _ => None,
        }
    }

    /// Wire size of one element. STRING elements are null-delimited and
    /// variable, reported as 1 so count clamping stays sane.
    pub fn element_size(self) -> usize {
        match self {
            DbrBase::String => 1,
            DbrBase::Char => 1,
            DbrBase::Short | DbrBase::Enum => 2,
            DbrBase::Float | DbrBase::Long => 4,
            DbrBase::Double => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DbrBase::String => "STRING",
            DbrBase::Short => "SHORT",
            DbrBase::Float => "FLOAT",
            DbrBase::Enum => "ENUM",
            DbrBase::Char => "CHAR",
            DbrBase::Long => "LONG",
            DbrBase::Double => "DOUBLE",
        }
    }
}

/// Metadata scope prefixed to the element data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbrScope {
    Plain = 0,
    Sts = 7,
    Time = 14,
    Gr = 21,
    Ctrl = 28,
}

impl DbrScope {
    pub fn from_offset(offset: u16) -> Option<Self> {
        match offset {
            0 => Some(DbrScope::Plain),
            7 => Some(DbrScope::Sts),
            14 => Some(DbrScope::Time),
            21 => Some(DbrScope::Gr),
            28 => Some(DbrScope::Ctrl),
            _ => None,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            DbrScope::Plain => "",
            DbrScope::Sts => "STS_",
            DbrScope::Time => "TIME_",
            DbrScope::Gr => "GR_",
            DbrScope::Ctrl => "CTRL_",
        }
    }
}

/// One of the 35 CA data types, as `scope x base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub scope: DbrScope,
    pub base: DbrBase,
}

impl DbrType {
    pub fn new(scope: DbrScope, base: DbrBase) -> Self {
        Self { scope, base }
    }

    pub fn plain(base: DbrBase) -> Self {
        Self::new(DbrScope::Plain, base)
    }

    /// Decode a wire type code. Codes above 34 are unknown.
    pub fn from_code(code: u16) -> Option<Self> {
        if code > 34 {
            return None;
        }
        let scope = DbrScope::from_offset(code / 7 * 7)?;
        let base = DbrBase::from_index(code % 7)?;
        Some(Self { scope, base })
    }

    /// Wire type code: `scope_offset + base_index`.
    pub fn code(self) -> u16 {
        self.scope as u16 + self.base as u16
    }

    /// The TIME_ variant of this type's base (subscriptions always request
    /// TIME_ so updates carry server timestamps).
    pub fn time_variant(self) -> Self {
        Self::new(DbrScope::Time, self.base)
    }

    /// The plain variant of this type's base.
    pub fn base_only(self) -> Self {
        Self::plain(self.base)
    }

    /// Size of the metadata header prepended to the element data, including
    /// the alignment padding of the C structs this wire format mirrors.
    pub fn meta_size(self) -> usize {
        match self.scope {
            DbrScope::Plain => 0,
            // status:u16, severity:u16, then pad so elements stay aligned
            DbrScope::Sts => {
                4 + match self.base {
                    DbrBase::Char => 1,
                    DbrBase::Double => 4,
                    _ => 0,
                }
            }
            // status, severity, seconds:u32, nanoseconds:u32, then pad
            DbrScope::Time => {
                12 + match self.base {
                    DbrBase::Short | DbrBase::Enum => 2,
                    DbrBase::Char => 3,
                    DbrBase::Double => 4,
                    _ => 0,
                }
            }
            DbrScope::Gr => 4 + Self::limits_block(self.base, GR_LIMITS),
            DbrScope::Ctrl => 4 + Self::limits_block(self.base, CTRL_LIMITS),
        }
    }

    /// GR_/CTRL_ per-base block after status/severity: precision + pad for
    /// the float kinds, the unit string, and `limits` limit values (or the
    /// ENUM state-string table).
    fn limits_block(base: DbrBase, limits: usize) -> usize {
        match base {
            DbrBase::String => 0,
            DbrBase::Short => UNIT_SIZE + limits * 2,
            DbrBase::Float => 2 + 2 + UNIT_SIZE + limits * 4,
            DbrBase::Enum => 2 + ENUM_STRINGS_SIZE,
            DbrBase::Char => UNIT_SIZE + limits + 1,
            DbrBase::Long => UNIT_SIZE + limits * 4,
            DbrBase::Double => 2 + 2 + UNIT_SIZE + limits * 8,
        }
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scope.prefix(), self.base.name())
    }
}

/// Type name for a raw wire code, for diagnostics. Unknown codes print as
/// the number itself.
pub fn type_name(code: u16) -> String {
    match DbrType::from_code(code) {
        Some(dbr) => dbr.to_string(),
        None => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_35_codes_roundtrip() {
        for code in 0..=34u16 {
            let dbr = DbrType::from_code(code).expect("codes 0..=34 are valid");
            assert_eq!(dbr.code(), code);
        }
        assert!(DbrType::from_code(35).is_none());
        assert!(DbrType::from_code(0xFFFF).is_none());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(type_name(0), "STRING");
        assert_eq!(type_name(6), "DOUBLE");
        assert_eq!(type_name(13), "STS_DOUBLE");
        assert_eq!(type_name(20), "TIME_DOUBLE");
        assert_eq!(type_name(27), "GR_DOUBLE");
        assert_eq!(type_name(34), "CTRL_DOUBLE");
        assert_eq!(type_name(99), "99");
    }

    #[test]
    fn test_time_promotion() {
        let plain = DbrType::from_code(5).expect("LONG");
        assert_eq!(plain.time_variant().code(), 19); // TIME_LONG
        assert_eq!(plain.time_variant().to_string(), "TIME_LONG");
        assert_eq!(plain.time_variant().base_only().code(), 5);
    }

    #[test]
    fn test_sts_meta_sizes() {
        let size = |code| DbrType::from_code(code).expect("valid").meta_size();
        assert_eq!(size(7), 4); // STS_STRING
        assert_eq!(size(8), 4); // STS_SHORT
        assert_eq!(size(11), 5); // STS_CHAR (+1 pad)
        assert_eq!(size(13), 8); // STS_DOUBLE (+4 pad)
    }

    #[test]
    fn test_time_meta_sizes() {
        let size = |code| DbrType::from_code(code).expect("valid").meta_size();
        assert_eq!(size(14), 12); // TIME_STRING
        assert_eq!(size(15), 14); // TIME_SHORT (+2)
        assert_eq!(size(16), 12); // TIME_FLOAT
        assert_eq!(size(17), 14); // TIME_ENUM (+2)
        assert_eq!(size(18), 15); // TIME_CHAR (+3)
        assert_eq!(size(19), 12); // TIME_LONG
        assert_eq!(size(20), 16); // TIME_DOUBLE (+4)
    }

    #[test]
    fn test_gr_meta_sizes() {
        let size = |code| DbrType::from_code(code).expect("valid").meta_size();
        assert_eq!(size(21), 4); // GR_STRING
        assert_eq!(size(22), 4 + 8 + 12); // GR_SHORT
        assert_eq!(size(23), 4 + 2 + 2 + 8 + 24); // GR_FLOAT
        assert_eq!(size(24), 4 + 2 + 416); // GR_ENUM
        assert_eq!(size(25), 4 + 8 + 6 + 1); // GR_CHAR
        assert_eq!(size(26), 4 + 8 + 24); // GR_LONG
        assert_eq!(size(27), 4 + 2 + 2 + 8 + 48); // GR_DOUBLE
    }

    #[test]
    fn test_ctrl_meta_sizes() {
        let size = |code| DbrType::from_code(code).expect("valid").meta_size();
        assert_eq!(size(28), 4); // CTRL_STRING
        assert_eq!(size(29), 4 + 8 + 16); // CTRL_SHORT
        assert_eq!(size(30), 4 + 2 + 2 + 8 + 32); // CTRL_FLOAT
        assert_eq!(size(31), 4 + 2 + 416); // CTRL_ENUM
        assert_eq!(size(32), 4 + 8 + 8 + 1); // CTRL_CHAR
        assert_eq!(size(33), 4 + 8 + 32); // CTRL_LONG
        assert_eq!(size(34), 4 + 2 + 2 + 8 + 64); // CTRL_DOUBLE
    }
}
