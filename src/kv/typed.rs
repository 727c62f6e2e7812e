//! Typed accessors
//!
//! Small get/put helpers that pair a key with one of the value codecs.
//! A value that does not decode is an internal inconsistency.

use crate::coding::{
    decode_bool, decode_int, decode_string, decode_var_int, encode_bool, encode_int,
    encode_string, encode_var_int,
};
use crate::error::{IdbError, Result};

use super::{KvView, KvWrite};

fn decode_or_inconsistent<T>(value: Option<Vec<u8>>, decode: impl FnOnce(&[u8]) -> Option<T>) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(bytes) => decode(&bytes)
            .map(Some)
            .ok_or(IdbError::InternalInconsistency("stored value failed to decode")),
    }
}

pub fn get_int<V: KvView + ?Sized>(view: &V, key: &[u8]) -> Result<Option<i64>> {
    decode_or_inconsistent(view.get(key)?, decode_int)
}

pub fn put_int<W: KvWrite + ?Sized>(txn: &mut W, key: Vec<u8>, value: i64) -> Result<()> {
    txn.put(key, encode_int(value))
}

pub fn get_var_int<V: KvView + ?Sized>(view: &V, key: &[u8]) -> Result<Option<i64>> {
    decode_or_inconsistent(view.get(key)?, |bytes| {
        let mut input = bytes;
        let value = decode_var_int(&mut input)?;
        input.is_empty().then_some(value)
    })
}

pub fn put_var_int<W: KvWrite + ?Sized>(txn: &mut W, key: Vec<u8>, value: i64) -> Result<()> {
    let mut out = Vec::new();
    encode_var_int(value, &mut out);
    txn.put(key, out)
}

pub fn get_string<V: KvView + ?Sized>(view: &V, key: &[u8]) -> Result<Option<String>> {
    decode_or_inconsistent(view.get(key)?, decode_string)
}

pub fn put_string<W: KvWrite + ?Sized>(txn: &mut W, key: Vec<u8>, value: &str) -> Result<()> {
    txn.put(key, encode_string(value))
}

pub fn get_bool<V: KvView + ?Sized>(view: &V, key: &[u8]) -> Result<Option<bool>> {
    decode_or_inconsistent(view.get(key)?, decode_bool)
}

pub fn put_bool<W: KvWrite + ?Sized>(txn: &mut W, key: Vec<u8>, value: bool) -> Result<()> {
    txn.put(key, encode_bool(value))
}
