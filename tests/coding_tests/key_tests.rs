//! Tests for key encoding
//!
//! These tests verify:
//! - Encoded user keys sort like the keys they encode
//! - Decoders reject malformed or trailing input
//! - Persisted key types stay inside their prefix ranges
//! - Index key bounds bracket every entry of a user key
//! - Key paths and external object descriptors decode what was stored

use std::time::{Duration, UNIX_EPOCH};

use atlas_idb::coding::external::{
    decode_external_objects, decode_v3_external_objects, encode_external_objects,
    encode_v3_external_objects,
};
use atlas_idb::coding::keys::{
    BlobEntryKey, ExistsEntryKey, IndexDataKey, KeyPrefix, KeyType, ObjectStoreDataKey,
};
use atlas_idb::coding::{encode_string, prefix_successor, IdbKey, KeyPath, KeyRange};
use atlas_idb::{ExternalObject, ExternalObjectKind};

// =============================================================================
// Helper Functions
// =============================================================================

fn assert_sorted(keys: &[IdbKey]) {
    for pair in keys.windows(2) {
        assert!(
            pair[0].encode() < pair[1].encode(),
            "{:?} should sort before {:?}",
            pair[0],
            pair[1]
        );
    }
}

// =============================================================================
// User Key Ordering Tests
// =============================================================================

#[test]
fn test_number_keys_sort_numerically() {
    assert_sorted(&[
        IdbKey::number(f64::NEG_INFINITY),
        IdbKey::number(-1e10),
        IdbKey::number(-1.5),
        IdbKey::number(0.0),
        IdbKey::number(0.5),
        IdbKey::number(3.0),
        IdbKey::number(1e10),
        IdbKey::number(f64::INFINITY),
    ]);
}

#[test]
fn test_negative_zero_encodes_as_zero() {
    assert_eq!(IdbKey::number(-0.0).encode(), IdbKey::number(0.0).encode());
}

#[test]
fn test_key_types_sort_in_type_order() {
    assert_sorted(&[
        IdbKey::number(1e300),
        IdbKey::Date(-5.0),
        IdbKey::string(""),
        IdbKey::Binary(Vec::new()),
        IdbKey::Array(Vec::new()),
    ]);
}

#[test]
fn test_string_prefix_sorts_before_extension() {
    assert_sorted(&[
        IdbKey::string(""),
        IdbKey::string("a"),
        IdbKey::string("ab"),
        IdbKey::string("abc"),
        IdbKey::string("b"),
    ]);
}

#[test]
fn test_binary_keys_with_zero_bytes() {
    assert_sorted(&[
        IdbKey::Binary(vec![]),
        IdbKey::Binary(vec![0]),
        IdbKey::Binary(vec![0, 0]),
        IdbKey::Binary(vec![0, 1]),
        IdbKey::Binary(vec![1]),
        IdbKey::Binary(vec![0xFF]),
    ]);
}

#[test]
fn test_array_keys_compare_elementwise() {
    assert_sorted(&[
        IdbKey::Array(vec![]),
        IdbKey::Array(vec![IdbKey::number(1.0)]),
        IdbKey::Array(vec![IdbKey::number(1.0), IdbKey::number(2.0)]),
        IdbKey::Array(vec![IdbKey::number(1.0), IdbKey::string("x")]),
        IdbKey::Array(vec![IdbKey::number(2.0)]),
    ]);
}

#[test]
fn test_nested_key_decodes_exactly() {
    let key = IdbKey::Array(vec![
        IdbKey::string("user"),
        IdbKey::Array(vec![IdbKey::Binary(vec![0, 0xFF, 0]), IdbKey::Date(1_700_000_000_000.0)]),
        IdbKey::number(-42.25),
    ]);

    assert_eq!(IdbKey::decode_exact(&key.encode()), Some(key));
}

#[test]
fn test_decode_exact_rejects_trailing_bytes() {
    let mut encoded = IdbKey::string("id").encode();
    encoded.push(0x10);

    assert_eq!(IdbKey::decode_exact(&encoded), None);
}

#[test]
fn test_decode_rejects_truncated_and_unknown_input() {
    let encoded = IdbKey::number(7.0).encode();
    assert_eq!(IdbKey::decode_exact(&encoded[..4]), None);
    assert_eq!(IdbKey::decode_exact(&[0x77, 1, 2]), None);

    let unterminated_array = vec![0x50, 0x10];
    assert_eq!(IdbKey::decode_exact(&unterminated_array), None);
}

#[test]
fn test_nan_key_is_invalid() {
    assert!(!IdbKey::number(f64::NAN).is_valid());
    assert!(!IdbKey::Array(vec![IdbKey::number(1.0), IdbKey::Date(f64::NAN)]).is_valid());
    assert!(IdbKey::string("ok").is_valid());
}

#[test]
fn test_key_range_only_key() {
    assert!(KeyRange::only(IdbKey::number(1.0)).is_only_key());
    assert!(!KeyRange::bound(IdbKey::number(1.0), IdbKey::number(1.0), true, false).is_only_key());
    assert!(!KeyRange::all().is_only_key());
}

// =============================================================================
// Persisted Key Tests
// =============================================================================

#[test]
fn test_key_prefix_orders_by_id_then_length() {
    assert!(KeyPrefix::new(1, 255, 1).encode() < KeyPrefix::new(1, 256, 1).encode());
    assert!(KeyPrefix::new(255, 0, 0).encode() < KeyPrefix::new(256, 0, 0).encode());
    assert!(KeyPrefix::database(1).encode() < KeyPrefix::new(1, 1, 1).encode());

    let mut input: &[u8] = &KeyPrefix::new(300, 7, 31).encode();
    assert_eq!(KeyPrefix::decode(&mut input), Some(KeyPrefix::new(300, 7, 31)));
    assert!(input.is_empty());
}

#[test]
fn test_key_prefix_types() {
    assert_eq!(KeyPrefix::global().key_type(), KeyType::GlobalMetadata);
    assert_eq!(KeyPrefix::database(4).key_type(), KeyType::DatabaseMetadata);
    assert_eq!(KeyPrefix::new(4, 1, 1).key_type(), KeyType::ObjectStoreData);
    assert_eq!(KeyPrefix::new(4, 1, 2).key_type(), KeyType::ExistsEntry);
    assert_eq!(KeyPrefix::new(4, 1, 3).key_type(), KeyType::BlobEntry);
    assert_eq!(KeyPrefix::new(4, 1, 30).key_type(), KeyType::IndexData);
    assert_eq!(KeyPrefix::new(4, 1, 12).key_type(), KeyType::InvalidType);
}

#[test]
fn test_data_keys_stay_within_store_range() {
    let keys = [
        IdbKey::number(-1.0),
        IdbKey::string("zzz"),
        IdbKey::Binary(vec![0xFF; 16]),
        IdbKey::Array(vec![IdbKey::Array(vec![IdbKey::string("deep")])]),
    ];
    let min = ObjectStoreDataKey::encode_min_key(1, 1);
    let max = ObjectStoreDataKey::encode_max_key(1, 1);
    let exists_start = ExistsEntryKey::encode_min_key(1, 1);
    let next_store = KeyPrefix::object_store(1, 2).encode();

    for key in &keys {
        let data_key = ObjectStoreDataKey::encode(1, 1, key);
        assert!(min < data_key && data_key < max);
        assert!(data_key < exists_start);
        assert!(ExistsEntryKey::encode(1, 1, key) < next_store);
        assert_eq!(ObjectStoreDataKey::decode_user_key(&data_key).as_ref(), Some(key));
    }
}

#[test]
fn test_index_past_key_brackets_user_key_group() {
    let user_key = IdbKey::string("a").encode();
    let longer_key = IdbKey::string("ab").encode();
    let prefix = IndexDataKey::encode_user_key_prefix(1, 1, 30, &user_key);
    let past = IndexDataKey::encode_past_user_key(1, 1, 30, &user_key);

    for primary_key in [IdbKey::number(1.0), IdbKey::Array(vec![IdbKey::Binary(vec![0xFF])])] {
        let entry = IndexDataKey::encode(1, 1, 30, &user_key, &primary_key.encode());
        assert!(prefix <= entry && entry < past);
    }

    let next_group = IndexDataKey::encode(1, 1, 30, &longer_key, &IdbKey::number(0.0).encode());
    assert!(past < next_group);
    assert!(next_group < IndexDataKey::encode_max_key(1, 1, 30));
}

#[test]
fn test_index_data_key_decode() {
    let encoded = IndexDataKey::encode(
        2,
        5,
        31,
        &IdbKey::string("tag").encode(),
        &IdbKey::number(9.0).encode(),
    );

    let decoded = IndexDataKey::decode(&encoded).unwrap();

    assert_eq!(decoded.database_id, 2);
    assert_eq!(decoded.object_store_id, 5);
    assert_eq!(decoded.index_id, 31);
    assert_eq!(decoded.user_key, IdbKey::string("tag"));
    assert_eq!(decoded.primary_key, Some(IdbKey::number(9.0)));

    let data_key = ObjectStoreDataKey::encode(2, 5, &IdbKey::string("tag"));
    assert_eq!(IndexDataKey::decode(&data_key), None);
}

#[test]
fn test_blob_entry_key_conversions() {
    let user_key = IdbKey::string("photo");
    let data_key = ObjectStoreDataKey::encode(3, 2, &user_key);

    let blob_key = BlobEntryKey::from_object_store_data_key(&data_key).unwrap();
    assert_eq!(blob_key.database_id, 3);
    assert_eq!(blob_key.object_store_id, 2);
    assert_eq!(blob_key.encoded_user_key, user_key.encode());

    let encoded = blob_key.encode();
    assert!(encoded >= BlobEntryKey::encode_min_key_for_object_store(3, 2));
    assert!(encoded < BlobEntryKey::encode_stop_key_for_object_store(3, 2));
    assert_eq!(BlobEntryKey::reencode_to_object_store_data_key(&encoded), Some(data_key.clone()));

    // A data key is not a blob entry key
    assert_eq!(BlobEntryKey::decode(&data_key), None);
}

#[test]
fn test_prefix_successor() {
    assert_eq!(prefix_successor(&[1, 2, 3]), vec![1, 2, 4]);
    assert_eq!(prefix_successor(&[1, 2, 0xFF]), vec![1, 3]);
    assert!(prefix_successor(&[0xFF, 0xFF]).is_empty());
}

// =============================================================================
// Key Path Tests
// =============================================================================

#[test]
fn test_key_path_encodings() {
    for path in [
        KeyPath::Null,
        KeyPath::String("id".to_string()),
        KeyPath::Array(vec!["a.b".to_string(), "c".to_string()]),
    ] {
        assert_eq!(KeyPath::decode(&path.encode()), Some(path));
    }
}

#[test]
fn test_legacy_key_path_is_bare_string() {
    let legacy = encode_string("id");

    assert_eq!(KeyPath::decode(&legacy), Some(KeyPath::String("id".to_string())));
}

// =============================================================================
// External Object Descriptor Tests
// =============================================================================

#[test]
fn test_external_objects_decode_stored_descriptors() {
    let modified = UNIX_EPOCH + Duration::from_micros(1_600_000_000_000_000);
    let objects = vec![
        ExternalObject::stored_blob(2, "image/png".to_string(), 1024),
        ExternalObject::stored_file(3, "text/plain".to_string(), 12, "notes.txt".to_string(), Some(modified)),
        ExternalObject::stored_handle(vec![9, 8, 7]),
    ];

    let decoded = decode_external_objects(&encode_external_objects(&objects)).unwrap();

    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0].kind(), ExternalObjectKind::Blob);
    assert_eq!(decoded[0].blob_number(), 2);
    assert_eq!(decoded[0].mime_type(), "image/png");
    assert_eq!(decoded[0].size(), 1024);
    assert_eq!(decoded[1].kind(), ExternalObjectKind::File);
    assert_eq!(decoded[1].file_name(), "notes.txt");
    assert_eq!(decoded[1].last_modified(), Some(modified));
    assert_eq!(decoded[2].kind(), ExternalObjectKind::FileSystemAccessHandle);
    assert_eq!(decoded[2].serialized_handle(), &[9, 8, 7]);
}

#[test]
fn test_external_objects_reject_unknown_type() {
    assert!(decode_external_objects(&[7, 1, 2]).is_none());
    assert_eq!(decode_external_objects(&[]).map(|objects| objects.len()), Some(0));
}

#[test]
fn test_v3_descriptors_lose_file_size() {
    let objects = vec![
        ExternalObject::stored_blob(4, "a/b".to_string(), 77),
        ExternalObject::stored_file(5, "c/d".to_string(), 10, "f.bin".to_string(), None),
    ];

    let decoded = decode_v3_external_objects(&encode_v3_external_objects(&objects)).unwrap();

    assert_eq!(decoded[0].size(), 77);
    assert_eq!(decoded[1].size(), -1);
    assert_eq!(decoded[1].file_name(), "f.bin");
    assert_eq!(decoded[1].last_modified(), None);
}
