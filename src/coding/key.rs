//! User keys, key ranges and key paths
//!
//! User keys sort Number < Date < String < Binary < Array. The encoding
//! below gives each type a tag in that order and encodes the payload so
//! that bytewise comparison matches key comparison.

use super::{
    decode_byte, decode_ordered_bytes, decode_ordered_string, decode_string,
    decode_string_with_length, decode_var_int, encode_ordered_bytes, encode_ordered_string,
    encode_string_with_length, encode_var_int,
};

const ARRAY_TERMINATOR: u8 = 0x01;
const NUMBER_TAG: u8 = 0x10;
const DATE_TAG: u8 = 0x20;
const STRING_TAG: u8 = 0x30;
const BINARY_TAG: u8 = 0x40;
const ARRAY_TAG: u8 = 0x50;

/// Appended after an encoded user key, sorts after anything that can follow it
pub const PAST_KEY_SENTINEL: u8 = 0xFF;

/// Arrays nested deeper than this are rejected when decoding
const MAX_ARRAY_DEPTH: usize = 2000;

// =============================================================================
// IdbKey
// =============================================================================

/// A user-supplied key
#[derive(Debug, Clone, PartialEq)]
pub enum IdbKey {
    Number(f64),
    /// Milliseconds since the Unix epoch
    Date(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<IdbKey>),
}

impl IdbKey {
    pub fn number(value: f64) -> Self {
        IdbKey::Number(value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        IdbKey::String(value.into())
    }

    /// NaN is never a valid key
    pub fn is_valid(&self) -> bool {
        match self {
            IdbKey::Number(value) | IdbKey::Date(value) => !value.is_nan(),
            IdbKey::Array(items) => items.iter().all(IdbKey::is_valid),
            IdbKey::String(_) | IdbKey::Binary(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            IdbKey::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Order-preserving, self-delimiting encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, into: &mut Vec<u8>) {
        match self {
            IdbKey::Number(value) => {
                into.push(NUMBER_TAG);
                into.extend_from_slice(&ordered_double(*value));
            }
            IdbKey::Date(value) => {
                into.push(DATE_TAG);
                into.extend_from_slice(&ordered_double(*value));
            }
            IdbKey::String(value) => {
                into.push(STRING_TAG);
                encode_ordered_string(value, into);
            }
            IdbKey::Binary(value) => {
                into.push(BINARY_TAG);
                encode_ordered_bytes(value, into);
            }
            IdbKey::Array(items) => {
                into.push(ARRAY_TAG);
                for item in items {
                    item.encode_into(into);
                }
                into.push(ARRAY_TERMINATOR);
            }
        }
    }

    pub fn decode(input: &mut &[u8]) -> Option<IdbKey> {
        decode_key_at_depth(input, 0)
    }

    /// Decodes a slice that must contain exactly one key
    pub fn decode_exact(bytes: &[u8]) -> Option<IdbKey> {
        let mut input = bytes;
        let key = Self::decode(&mut input)?;
        input.is_empty().then_some(key)
    }
}

fn decode_key_at_depth(input: &mut &[u8], depth: usize) -> Option<IdbKey> {
    match decode_byte(input)? {
        NUMBER_TAG => Some(IdbKey::Number(decode_ordered_double(input)?)),
        DATE_TAG => Some(IdbKey::Date(decode_ordered_double(input)?)),
        STRING_TAG => Some(IdbKey::String(decode_ordered_string(input)?)),
        BINARY_TAG => Some(IdbKey::Binary(decode_ordered_bytes(input)?)),
        ARRAY_TAG => {
            if depth >= MAX_ARRAY_DEPTH {
                return None;
            }
            let mut items = Vec::new();
            loop {
                if *input.first()? == ARRAY_TERMINATOR {
                    *input = &input[1..];
                    return Some(IdbKey::Array(items));
                }
                items.push(decode_key_at_depth(input, depth + 1)?);
            }
        }
        _ => None,
    }
}

/// Positive doubles get the sign bit set, negative ones are inverted, so
/// the big-endian bytes sort numerically.
fn ordered_double(value: f64) -> [u8; 8] {
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if value.is_sign_negative() { !bits } else { bits | (1 << 63) };
    ordered.to_be_bytes()
}

fn decode_ordered_double(input: &mut &[u8]) -> Option<f64> {
    if input.len() < 8 {
        return None;
    }
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    let ordered = u64::from_be_bytes(bytes.try_into().ok()?);
    let bits = if ordered & (1 << 63) != 0 { ordered & !(1 << 63) } else { !ordered };
    Some(f64::from_bits(bits))
}

// =============================================================================
// KeyRange
// =============================================================================

/// Bounds of a scan; `None` means unbounded on that side
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    pub lower: Option<IdbKey>,
    pub upper: Option<IdbKey>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Every key
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly one key
    pub fn only(key: IdbKey) -> Self {
        Self { lower: Some(key.clone()), upper: Some(key), lower_open: false, upper_open: false }
    }

    pub fn bound(lower: IdbKey, upper: IdbKey, lower_open: bool, upper_open: bool) -> Self {
        Self { lower: Some(lower), upper: Some(upper), lower_open, upper_open }
    }

    pub fn lower_bound(lower: IdbKey, open: bool) -> Self {
        Self { lower: Some(lower), lower_open: open, ..Self::default() }
    }

    pub fn upper_bound(upper: IdbKey, open: bool) -> Self {
        Self { upper: Some(upper), upper_open: open, ..Self::default() }
    }

    pub fn is_only_key(&self) -> bool {
        !self.lower_open
            && !self.upper_open
            && self.lower.is_some()
            && self.lower == self.upper
    }
}

// =============================================================================
// KeyPath
// =============================================================================

const KEY_PATH_TYPE_CODED_BYTE_1: u8 = 0;
const KEY_PATH_TYPE_CODED_BYTE_2: u8 = 0;
const KEY_PATH_NULL: u8 = 0;
const KEY_PATH_STRING: u8 = 1;
const KEY_PATH_ARRAY: u8 = 2;

/// Where an object store or index finds its keys inside a value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyPath {
    #[default]
    Null,
    String(String),
    Array(Vec<String>),
}

impl KeyPath {
    pub fn is_null(&self) -> bool {
        matches!(self, KeyPath::Null)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![KEY_PATH_TYPE_CODED_BYTE_1, KEY_PATH_TYPE_CODED_BYTE_2];
        match self {
            KeyPath::Null => out.push(KEY_PATH_NULL),
            KeyPath::String(path) => {
                out.push(KEY_PATH_STRING);
                encode_string_with_length(path, &mut out);
            }
            KeyPath::Array(paths) => {
                out.push(KEY_PATH_ARRAY);
                encode_var_int(paths.len() as i64, &mut out);
                for path in paths {
                    encode_string_with_length(path, &mut out);
                }
            }
        }
        out
    }

    /// Decodes a whole slice. Values without the two-byte type marker are
    /// legacy bare strings.
    pub fn decode(bytes: &[u8]) -> Option<KeyPath> {
        if bytes.len() < 3
            || bytes[0] != KEY_PATH_TYPE_CODED_BYTE_1
            || bytes[1] != KEY_PATH_TYPE_CODED_BYTE_2
        {
            return decode_string(bytes).map(KeyPath::String);
        }
        let mut input = &bytes[3..];
        let path = match bytes[2] {
            KEY_PATH_NULL => KeyPath::Null,
            KEY_PATH_STRING => KeyPath::String(decode_string_with_length(&mut input)?),
            KEY_PATH_ARRAY => {
                let count = usize::try_from(decode_var_int(&mut input)?).ok()?;
                let mut paths = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    paths.push(decode_string_with_length(&mut input)?);
                }
                KeyPath::Array(paths)
            }
            _ => return None,
        };
        input.is_empty().then_some(path)
    }
}
