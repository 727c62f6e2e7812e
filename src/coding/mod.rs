//! Key Encoding Layer
//!
//! Pure functions that turn logical entities into byte strings whose
//! bytewise order is the logical order, and back.
//!
//! ## Responsibilities
//! - Primitive value codecs (ints, varints, UTF-16 strings, binary, doubles)
//! - Order-preserving codecs used inside keys
//! - User keys, key ranges and key paths (`key`)
//! - Every persisted key type (`keys`)
//! - External object (blob) descriptors (`external`)
//!
//! Decoders take `&mut &[u8]`, consume what they read and return `None` on
//! malformed input. Callers report that as a consistency error.
//!
//! ## Order-preserving integers
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (1)  │ big-endian bytes, no leading│
//! │  0..=8   │ zero bytes (Len of them)    │
//! └──────────┴─────────────────────────────┘
//! ```
//! A shorter encoding is always a smaller number.
//!
//! ## Order-preserving byte strings
//! `0x00` is escaped as `0x00 0xFF`, the string ends with `0x00 0x01`.
//! A proper prefix therefore sorts before every extension of it.

pub mod external;
pub mod key;
pub mod keys;

pub use key::{IdbKey, KeyPath, KeyRange};

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

// =============================================================================
// Value codecs
// =============================================================================

pub fn encode_byte(value: u8, into: &mut Vec<u8>) {
    into.push(value);
}

pub fn decode_byte(input: &mut &[u8]) -> Option<u8> {
    let (&first, rest) = input.split_first()?;
    *input = rest;
    Some(first)
}

pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

/// Decodes a whole slice as a bool
pub fn decode_bool(input: &[u8]) -> Option<bool> {
    match input {
        [byte] => Some(*byte != 0),
        _ => None,
    }
}

/// Minimal little-endian encoding of a non-negative integer
pub fn encode_int(value: i64) -> Vec<u8> {
    debug_assert!(value >= 0);
    let mut n = value as u64;
    let mut out = Vec::with_capacity(8);
    loop {
        out.push((n & 0xff) as u8);
        n >>= 8;
        if n == 0 {
            break;
        }
    }
    out
}

/// Decodes a whole slice written by `encode_int`
pub fn decode_int(input: &[u8]) -> Option<i64> {
    if input.is_empty() || input.len() > 8 {
        return None;
    }
    let mut value: u64 = 0;
    for (shift, byte) in input.iter().enumerate() {
        value |= u64::from(*byte) << (shift * 8);
    }
    i64::try_from(value).ok()
}

/// LEB128 encoding of a non-negative integer
pub fn encode_var_int(value: i64, into: &mut Vec<u8>) {
    debug_assert!(value >= 0);
    let mut n = value as u64;
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        into.push(byte);
        if n == 0 {
            break;
        }
    }
}

pub fn decode_var_int(input: &mut &[u8]) -> Option<i64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = decode_byte(input)?;
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    i64::try_from(value).ok()
}

fn utf16_be(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

fn from_utf16_be(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// UTF-16BE code units, no length
pub fn encode_string(value: &str) -> Vec<u8> {
    utf16_be(value)
}

/// Decodes a whole slice written by `encode_string`
pub fn decode_string(input: &[u8]) -> Option<String> {
    from_utf16_be(input)
}

/// Code-unit count followed by UTF-16BE code units
pub fn encode_string_with_length(value: &str, into: &mut Vec<u8>) {
    let encoded = utf16_be(value);
    encode_var_int((encoded.len() / 2) as i64, into);
    into.extend_from_slice(&encoded);
}

pub fn decode_string_with_length(input: &mut &[u8]) -> Option<String> {
    let units = usize::try_from(decode_var_int(input)?).ok()?;
    let byte_len = units.checked_mul(2)?;
    if input.len() < byte_len {
        return None;
    }
    let (bytes, rest) = input.split_at(byte_len);
    *input = rest;
    from_utf16_be(bytes)
}

pub fn encode_binary(value: &[u8], into: &mut Vec<u8>) {
    encode_var_int(value.len() as i64, into);
    into.extend_from_slice(value);
}

pub fn decode_binary(input: &mut &[u8]) -> Option<Vec<u8>> {
    let len = usize::try_from(decode_var_int(input)?).ok()?;
    if input.len() < len {
        return None;
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Some(bytes.to_vec())
}

pub fn encode_double(value: f64, into: &mut Vec<u8>) {
    into.extend_from_slice(&value.to_le_bytes());
}

pub fn decode_double(input: &mut &[u8]) -> Option<f64> {
    if input.len() < 8 {
        return None;
    }
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    Some(f64::from_le_bytes(bytes.try_into().ok()?))
}

// =============================================================================
// Order-preserving codecs
// =============================================================================

pub fn encode_ordered_int(value: i64, into: &mut Vec<u8>) {
    debug_assert!(value >= 0);
    let bytes = (value as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|byte| **byte == 0).count();
    into.push((8 - skip) as u8);
    into.extend_from_slice(&bytes[skip..]);
}

pub fn decode_ordered_int(input: &mut &[u8]) -> Option<i64> {
    let len = usize::from(decode_byte(input)?);
    if len > 8 || input.len() < len {
        return None;
    }
    let (bytes, rest) = input.split_at(len);
    if bytes.first() == Some(&0) {
        return None;
    }
    *input = rest;
    let value = bytes.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    i64::try_from(value).ok()
}

pub fn encode_ordered_bytes(value: &[u8], into: &mut Vec<u8>) {
    for &byte in value {
        into.push(byte);
        if byte == ESCAPE {
            into.push(ESCAPED_ZERO);
        }
    }
    into.push(ESCAPE);
    into.push(TERMINATOR);
}

pub fn decode_ordered_bytes(input: &mut &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut at = 0;
    loop {
        let byte = *input.get(at)?;
        if byte == ESCAPE {
            match *input.get(at + 1)? {
                ESCAPED_ZERO => out.push(ESCAPE),
                TERMINATOR => {
                    *input = &input[at + 2..];
                    return Some(out);
                }
                _ => return None,
            }
            at += 2;
        } else {
            out.push(byte);
            at += 1;
        }
    }
}

pub fn encode_ordered_string(value: &str, into: &mut Vec<u8>) {
    encode_ordered_bytes(&utf16_be(value), into);
}

pub fn decode_ordered_string(input: &mut &[u8]) -> Option<String> {
    from_utf16_be(&decode_ordered_bytes(input)?)
}

/// Smallest byte string greater than every string starting with `prefix`.
/// Empty when no such string exists (prefix is all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xFF {
            out.push(last + 1);
            return out;
        }
    }
    out
}

// =============================================================================
// Data format version
// =============================================================================

/// Serialization format of record values, as `(v8, blink)` versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFormatVersion {
    pub v8: u32,
    pub blink: u32,
}

impl DataFormatVersion {
    pub const CURRENT: DataFormatVersion = DataFormatVersion { v8: 15, blink: 21 };

    pub fn encode(self) -> i64 {
        (i64::from(self.v8) << 32) | i64::from(self.blink)
    }

    pub fn decode(value: i64) -> Self {
        Self { v8: (value >> 32) as u32, blink: (value & 0xffff_ffff) as u32 }
    }

    /// True when data written in `other` can be read by `self`
    pub fn is_at_least(self, other: DataFormatVersion) -> bool {
        self.v8 >= other.v8 && self.blink >= other.blink
    }
}
