//! External object descriptor encoding
//!
//! A blob entry value is a run of descriptors with no count prefix:
//!
//! ```text
//! Blob:   [0] varint(blob_number) str_len(mime) varint(size)
//! File:   [1] varint(blob_number) str_len(mime) varint(size)
//!             str_len(file_name) varint(last_modified_us)
//! Handle: [2] bin_len(serialized_token)
//! ```
//!
//! Schema v3 stored `[is_file] varint(blob_number) str_len(mime)` followed
//! by `str_len(file_name)` for files or `varint(size)` for blobs.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::external_object::{ExternalObject, ExternalObjectKind};

use super::{
    decode_binary, decode_byte, decode_string_with_length, decode_var_int, encode_binary,
    encode_string_with_length, encode_var_int,
};

const BLOB_TYPE: u8 = 0;
const FILE_TYPE: u8 = 1;
const FILE_SYSTEM_ACCESS_HANDLE_TYPE: u8 = 2;

pub fn encode_external_objects(objects: &[ExternalObject]) -> Vec<u8> {
    let mut out = Vec::new();
    for object in objects {
        match object.kind() {
            ExternalObjectKind::Blob | ExternalObjectKind::File => {
                let is_file = object.kind() == ExternalObjectKind::File;
                out.push(if is_file { FILE_TYPE } else { BLOB_TYPE });
                encode_var_int(object.blob_number(), &mut out);
                encode_string_with_length(object.mime_type(), &mut out);
                encode_var_int(object.size().max(0), &mut out);
                if is_file {
                    encode_string_with_length(object.file_name(), &mut out);
                    encode_var_int(to_micros(object.last_modified()), &mut out);
                }
            }
            ExternalObjectKind::FileSystemAccessHandle => {
                out.push(FILE_SYSTEM_ACCESS_HANDLE_TYPE);
                encode_binary(object.serialized_handle(), &mut out);
            }
        }
    }
    out
}

pub fn decode_external_objects(bytes: &[u8]) -> Option<Vec<ExternalObject>> {
    let mut input = bytes;
    let mut objects = Vec::new();
    while !input.is_empty() {
        let object = match decode_byte(&mut input)? {
            BLOB_TYPE => {
                let blob_number = decode_var_int(&mut input)?;
                let mime_type = decode_string_with_length(&mut input)?;
                let size = decode_var_int(&mut input)?;
                ExternalObject::stored_blob(blob_number, mime_type, size)
            }
            FILE_TYPE => {
                let blob_number = decode_var_int(&mut input)?;
                let mime_type = decode_string_with_length(&mut input)?;
                let size = decode_var_int(&mut input)?;
                let file_name = decode_string_with_length(&mut input)?;
                let last_modified = from_micros(decode_var_int(&mut input)?);
                ExternalObject::stored_file(blob_number, mime_type, size, file_name, Some(last_modified))
            }
            FILE_SYSTEM_ACCESS_HANDLE_TYPE => {
                ExternalObject::stored_handle(decode_binary(&mut input)?)
            }
            _ => return None,
        };
        objects.push(object);
    }
    Some(objects)
}

/// Decodes the schema v3 layout. Files come back with size -1 and no
/// modification time.
pub fn decode_v3_external_objects(bytes: &[u8]) -> Option<Vec<ExternalObject>> {
    let mut input = bytes;
    let mut objects = Vec::new();
    while !input.is_empty() {
        let is_file = decode_byte(&mut input)? != 0;
        let blob_number = decode_var_int(&mut input)?;
        let mime_type = decode_string_with_length(&mut input)?;
        let object = if is_file {
            let file_name = decode_string_with_length(&mut input)?;
            ExternalObject::stored_file(blob_number, mime_type, -1, file_name, None)
        } else {
            let size = decode_var_int(&mut input)?;
            ExternalObject::stored_blob(blob_number, mime_type, size)
        };
        objects.push(object);
    }
    Some(objects)
}

/// Encodes objects in the schema v3 layout (fixtures for migration)
pub fn encode_v3_external_objects(objects: &[ExternalObject]) -> Vec<u8> {
    let mut out = Vec::new();
    for object in objects.iter().filter(|object| object.has_blob_file()) {
        let is_file = object.kind() == ExternalObjectKind::File;
        out.push(u8::from(is_file));
        encode_var_int(object.blob_number(), &mut out);
        encode_string_with_length(object.mime_type(), &mut out);
        if is_file {
            encode_string_with_length(object.file_name(), &mut out);
        } else {
            encode_var_int(object.size().max(0), &mut out);
        }
    }
    out
}

fn to_micros(time: Option<SystemTime>) -> i64 {
    time.and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|since| i64::try_from(since.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn from_micros(micros: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(micros.max(0) as u64)
}
