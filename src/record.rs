//! Record values

use crate::external_object::ExternalObject;

/// A serialized record plus the external objects it carries
#[derive(Debug, Clone, Default)]
pub struct IdbValue {
    pub bits: Vec<u8>,
    pub external_objects: Vec<ExternalObject>,
}

impl IdbValue {
    pub fn new(bits: impl Into<Vec<u8>>) -> Self {
        Self { bits: bits.into(), external_objects: Vec::new() }
    }

    pub fn with_external_objects(bits: impl Into<Vec<u8>>, external_objects: Vec<ExternalObject>) -> Self {
        Self { bits: bits.into(), external_objects }
    }
}

/// The encoded primary key of a record and the version it was written at.
/// Index entries carry both so stale entries can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordIdentifier {
    pub primary_key: Vec<u8>,
    pub version: i64,
}

impl RecordIdentifier {
    pub fn new(primary_key: Vec<u8>, version: i64) -> Self {
        Self { primary_key, version }
    }
}
