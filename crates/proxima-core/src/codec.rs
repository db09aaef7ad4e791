//! Mapping between advertisements and GATT characteristics
//!
//! Every advertisement becomes one GATT service. Built-in fields live under
//! fixed, well-known characteristic UUIDs. Attributes and attachments each get
//! a characteristic whose UUID is derived from the key with UUID v5, so any
//! implementation computes the same id for the same key. Their values carry
//! `key=value`, split at the first `=` byte on the way back in.
//!
//! Decoding is lenient: a malformed characteristic is logged and skipped, it
//! never fails the whole advertisement.

use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use crate::advertisement::{Advertisement, Encryption, EncryptionAlgorithm};
use crate::errors::{CodecError, Result};
use crate::types::{AdHash, AdId, Stamp};

// ----------------------------------------------------------------------------
// Characteristic Identifiers
// ----------------------------------------------------------------------------

/// Characteristic holding the advertisement id
pub const ID_UUID: Uuid = Uuid::from_u128(0x3dd1d5a8_0001_4b2d_a4cc_1d6e3b5f0a01);

/// Characteristic holding the interface name
pub const INTERFACE_NAME_UUID: Uuid = Uuid::from_u128(0x3dd1d5a8_0002_4b2d_a4cc_1d6e3b5f0a01);

/// Characteristic holding the packed address list
pub const ADDRESSES_UUID: Uuid = Uuid::from_u128(0x3dd1d5a8_0003_4b2d_a4cc_1d6e3b5f0a01);

/// Characteristic holding the packed encryption metadata
pub const ENCRYPTION_UUID: Uuid = Uuid::from_u128(0x3dd1d5a8_0004_4b2d_a4cc_1d6e3b5f0a01);

/// Characteristic holding the content hash
pub const HASH_UUID: Uuid = Uuid::from_u128(0x3dd1d5a8_0005_4b2d_a4cc_1d6e3b5f0a01);

/// Characteristic holding the packed directory address list
pub const DIR_ADDRS_UUID: Uuid = Uuid::from_u128(0x3dd1d5a8_0006_4b2d_a4cc_1d6e3b5f0a01);

/// Namespace for characteristic ids derived from attribute and attachment keys
pub const ATTRIBUTE_NAMESPACE: Uuid = Uuid::from_u128(0x3dd1d5a8_00ff_4b2d_a4cc_1d6e3b5f0a01);

/// Prefix that marks an attachment key on the wire
pub const ATTACHMENT_PREFIX: &str = "__";

/// Largest value a single characteristic may carry
pub const MAX_CHARACTERISTIC_LEN: usize = 512;

/// Separator between key and value in attribute characteristics
const SEPARATOR: u8 = b'=';

/// Characteristic UUID to value, one map per GATT service
pub type CharacteristicMap = BTreeMap<Uuid, Vec<u8>>;

/// Characteristic id for an application attribute key
pub fn attribute_uuid(key: &str) -> Uuid {
    Uuid::new_v5(&ATTRIBUTE_NAMESPACE, key.as_bytes())
}

/// Characteristic id for an application attachment key
pub fn attachment_uuid(key: &str) -> Uuid {
    Uuid::new_v5(
        &ATTRIBUTE_NAMESPACE,
        format!("{}{}", ATTACHMENT_PREFIX, key).as_bytes(),
    )
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Encode an advertisement into its characteristic map
///
/// The `lost` flag is transient and never encoded. A zero id is rejected:
/// receivers treat it as a service without an advertisement.
pub fn encode(ad: &Advertisement) -> Result<CharacteristicMap> {
    let mut map = CharacteristicMap::new();

    if ad.id.is_zero() {
        return Err(CodecError::encode("id", "must not be zero"));
    }
    insert(&mut map, "id", ID_UUID, ad.id.as_bytes().to_vec())?;

    if ad.interface_name.is_empty() {
        return Err(CodecError::encode("interface_name", "must not be empty"));
    }
    insert(
        &mut map,
        "interface_name",
        INTERFACE_NAME_UUID,
        ad.interface_name.as_bytes().to_vec(),
    )?;

    if !ad.addresses.is_empty() {
        insert(&mut map, "addresses", ADDRESSES_UUID, pack_strings(&ad.addresses))?;
    }

    if let Some(encryption) = &ad.encryption {
        validate_algorithm(encryption.algorithm)?;
        insert(&mut map, "encryption", ENCRYPTION_UUID, pack_encryption(encryption))?;
    }

    insert(&mut map, "hash", HASH_UUID, ad.hash.as_bytes().to_vec())?;

    if !ad.dir_addrs.is_empty() {
        insert(&mut map, "dir_addrs", DIR_ADDRS_UUID, pack_strings(&ad.dir_addrs))?;
    }

    for (key, value) in &ad.attributes {
        let field = format!("attributes[{}]", key);
        validate_key(&field, key)?;
        if key.starts_with(ATTACHMENT_PREFIX) {
            return Err(CodecError::encode(
                field,
                format!("key must not start with reserved prefix `{}`", ATTACHMENT_PREFIX),
            ));
        }
        insert(
            &mut map,
            &field,
            attribute_uuid(key),
            join_key_value(key, value.as_bytes()),
        )?;
    }

    for (key, value) in &ad.attachments {
        let field = format!("attachments[{}]", key);
        validate_key(&field, key)?;
        let wire_key = format!("{}{}", ATTACHMENT_PREFIX, key);
        insert(
            &mut map,
            &field,
            attachment_uuid(key),
            join_key_value(&wire_key, value),
        )?;
    }

    Ok(map)
}

fn validate_key(field: &str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CodecError::encode(field, "key must not be empty"));
    }
    if key.as_bytes().contains(&SEPARATOR) {
        return Err(CodecError::encode(field, "key must not contain `=`"));
    }
    Ok(())
}

/// `Other` must not shadow a code with a named variant, or it would come
/// back as that variant
fn validate_algorithm(algorithm: EncryptionAlgorithm) -> Result<()> {
    if let EncryptionAlgorithm::Other(code) = algorithm {
        if EncryptionAlgorithm::from_code(code) != algorithm {
            return Err(CodecError::encode(
                "encryption",
                format!("algorithm code {} belongs to a named algorithm", code),
            ));
        }
    }
    Ok(())
}

fn insert(map: &mut CharacteristicMap, field: &str, uuid: Uuid, value: Vec<u8>) -> Result<()> {
    if value.len() > MAX_CHARACTERISTIC_LEN {
        return Err(CodecError::encode(
            field,
            format!(
                "encoded value is {} bytes (max: {})",
                value.len(),
                MAX_CHARACTERISTIC_LEN
            ),
        ));
    }
    map.insert(uuid, value);
    Ok(())
}

fn join_key_value(key: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1 + value.len());
    out.extend_from_slice(key.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(value);
    out
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Decode a characteristic map into an advertisement
///
/// Malformed entries are skipped with a warning; the remaining fields are
/// still returned.
pub fn decode(map: &CharacteristicMap) -> Advertisement {
    let mut ad = Advertisement::default();

    for (uuid, value) in map {
        if let Err(e) = decode_characteristic(&mut ad, uuid, value) {
            warn!("Skipping characteristic {}: {}", uuid, e);
        }
    }

    ad
}

fn decode_characteristic(ad: &mut Advertisement, uuid: &Uuid, value: &[u8]) -> Result<()> {
    match *uuid {
        ID_UUID => {
            ad.id = AdId::from_slice(value).ok_or_else(|| {
                CodecError::decode("id", format!("expected {} bytes, got {}", AdId::LEN, value.len()))
            })?;
        }
        INTERFACE_NAME_UUID => {
            ad.interface_name = utf8("interface_name", value.to_vec())?;
        }
        ADDRESSES_UUID => {
            ad.addresses = unpack_strings("addresses", value)?;
        }
        ENCRYPTION_UUID => {
            ad.encryption = Some(unpack_encryption(value)?);
        }
        HASH_UUID => {
            ad.hash = AdHash::from_slice(value).ok_or_else(|| {
                CodecError::decode(
                    "hash",
                    format!("expected {} bytes, got {}", AdHash::LEN, value.len()),
                )
            })?;
        }
        DIR_ADDRS_UUID => {
            ad.dir_addrs = unpack_strings("dir_addrs", value)?;
        }
        _ => {
            let split = value
                .iter()
                .position(|b| *b == SEPARATOR)
                .ok_or_else(|| CodecError::decode("attributes", "missing `=` separator"))?;
            let key = utf8("attributes", value[..split].to_vec())?;
            let payload = &value[split + 1..];

            match key.strip_prefix(ATTACHMENT_PREFIX) {
                Some(name) => {
                    ad.attachments.insert(name.to_string(), payload.to_vec());
                }
                None => {
                    let text = utf8("attributes", payload.to_vec())?;
                    ad.attributes.insert(key, text);
                }
            }
        }
    }
    Ok(())
}

fn utf8(field: &'static str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| CodecError::decode(field, e.to_string()))
}

// ----------------------------------------------------------------------------
// Packed Lists
// ----------------------------------------------------------------------------

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Read an unsigned LEB128 value, returning it with the bytes consumed
fn take_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn pack_bytes<'a>(out: &mut Vec<u8>, items: impl Iterator<Item = &'a [u8]>) {
    for item in items {
        put_uvarint(out, item.len() as u64);
        out.extend_from_slice(item);
    }
}

fn unpack_bytes(field: &'static str, mut data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    while !data.is_empty() {
        let (len, used) =
            take_uvarint(data).ok_or_else(|| CodecError::decode(field, "truncated length prefix"))?;
        data = &data[used..];
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= data.len())
            .ok_or_else(|| CodecError::decode(field, "length prefix exceeds payload"))?;
        items.push(data[..len].to_vec());
        data = &data[len..];
    }
    Ok(items)
}

fn pack_strings(items: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    pack_bytes(&mut out, items.iter().map(|s| s.as_bytes()));
    out
}

fn unpack_strings(field: &'static str, data: &[u8]) -> Result<Vec<String>> {
    unpack_bytes(field, data)?
        .into_iter()
        .map(|bytes| utf8(field, bytes))
        .collect()
}

fn pack_encryption(encryption: &Encryption) -> Vec<u8> {
    let mut out = Vec::new();
    put_uvarint(&mut out, u64::from(encryption.algorithm.code()));
    pack_bytes(&mut out, encryption.keys.iter().map(|k| k.as_slice()));
    out
}

fn unpack_encryption(data: &[u8]) -> Result<Encryption> {
    let (code, used) = take_uvarint(data)
        .ok_or_else(|| CodecError::decode("encryption", "missing algorithm"))?;
    let code = u32::try_from(code)
        .map_err(|_| CodecError::decode("encryption", "algorithm code out of range"))?;
    Ok(Encryption {
        algorithm: EncryptionAlgorithm::from_code(code),
        keys: unpack_bytes("encryption", &data[used..])?,
    })
}

// ----------------------------------------------------------------------------
// Stamp Payload
// ----------------------------------------------------------------------------

/// Declared length of the stamp inside the manufacturer payload
pub const STAMP_LEN: u8 = 8;

/// Size of the manufacturer payload: length byte plus stamp
pub const STAMP_PAYLOAD_LEN: usize = 1 + STAMP_LEN as usize;

/// Build the manufacturer-data payload carrying a stamp
pub fn encode_stamp(stamp: Stamp) -> [u8; STAMP_PAYLOAD_LEN] {
    let mut payload = [0u8; STAMP_PAYLOAD_LEN];
    payload[0] = STAMP_LEN;
    payload[1..].copy_from_slice(&stamp.to_be_bytes());
    payload
}

/// Extract the stamp from a manufacturer-data payload
pub fn decode_stamp(payload: &[u8]) -> Option<Stamp> {
    if payload.len() < STAMP_PAYLOAD_LEN || payload[0] != STAMP_LEN {
        return None;
    }
    let bytes: [u8; 8] = payload[1..STAMP_PAYLOAD_LEN].try_into().ok()?;
    Some(Stamp::from_be_bytes(bytes))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> Advertisement {
        Advertisement::new(AdId::new([1; 16]), "v.io/x/Room")
            .with_address("/ns/room42")
            .with_address("/ip4/10.0.0.1")
            .with_attribute("room", "42")
            .with_attribute("expr", "a=b")
            .with_attachment("icon", vec![0x00, b'=', 0xFF])
            .with_encryption(EncryptionAlgorithm::Ibe, vec![vec![1, 2, 3], vec![]])
            .with_dir_addr("/dir/0")
            .with_computed_hash()
    }

    #[test]
    fn test_round_trip() {
        let ad = room();
        let map = encode(&ad).unwrap();
        assert_eq!(decode(&map), ad);
    }

    #[test]
    fn test_derived_ids_are_stable() {
        let map = encode(&room()).unwrap();
        assert_eq!(map[&attribute_uuid("room")], b"room=42".to_vec());
        assert_eq!(map[&attachment_uuid("icon")], b"__icon=\x00=\xff".to_vec());
        assert_ne!(attribute_uuid("icon"), attachment_uuid("icon"));
        assert_eq!(attribute_uuid("room"), attribute_uuid("room"));
    }

    #[test]
    fn test_encode_rejects_bad_fields() {
        let ad = room().with_attribute("a=b", "x");
        match encode(&ad) {
            Err(CodecError::Encode { field, .. }) => assert_eq!(field, "attributes[a=b]"),
            other => panic!("unexpected result: {:?}", other),
        }

        let ad = room().with_attribute("__hidden", "x");
        assert!(matches!(encode(&ad), Err(CodecError::Encode { .. })));

        let ad = room().with_attachment("blob", vec![0u8; MAX_CHARACTERISTIC_LEN]);
        match encode(&ad) {
            Err(CodecError::Encode { field, .. }) => assert_eq!(field, "attachments[blob]"),
            other => panic!("unexpected result: {:?}", other),
        }

        let ad = Advertisement::new(AdId::new([1; 16]), "");
        match encode(&ad) {
            Err(CodecError::Encode { field, .. }) => assert_eq!(field, "interface_name"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_zero_id() {
        let ad = Advertisement::new(AdId::default(), "v.io/x/Room").with_computed_hash();
        match encode(&ad) {
            Err(CodecError::Encode { field, .. }) => assert_eq!(field, "id"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_shadowed_algorithm_code() {
        for code in [1, 2] {
            let ad = room().with_encryption(EncryptionAlgorithm::Other(code), vec![vec![9]]);
            match encode(&ad) {
                Err(CodecError::Encode { field, .. }) => assert_eq!(field, "encryption"),
                other => panic!("unexpected result: {:?}", other),
            }
        }

        let ad = room().with_encryption(EncryptionAlgorithm::Other(7), vec![vec![9]]);
        let decoded = decode(&encode(&ad).unwrap());
        assert_eq!(decoded.encryption, ad.encryption);
    }

    #[test]
    fn test_decode_skips_malformed_entries() {
        let mut map = encode(&room()).unwrap();
        map.insert(Uuid::from_u128(1), b"no separator".to_vec());
        map.insert(Uuid::from_u128(2), vec![b'k', b'=', 0xFF, 0xFE]);
        map.insert(ADDRESSES_UUID, vec![0x05, b'a']);

        let ad = decode(&map);
        assert_eq!(ad.attributes.len(), 2);
        assert!(ad.addresses.is_empty());
        assert_eq!(ad.interface_name, "v.io/x/Room");
    }

    #[test]
    fn test_uvarint_multi_byte() {
        let mut out = Vec::new();
        put_uvarint(&mut out, 300);
        assert_eq!(out, vec![0xAC, 0x02]);
        assert_eq!(take_uvarint(&out), Some((300, 2)));
        assert_eq!(take_uvarint(&[0x80]), None);
    }

    #[test]
    fn test_stamp_payload() {
        let stamp = Stamp::new(0x1122_3344_5566_7788);
        let payload = encode_stamp(stamp);
        assert_eq!(payload, [8, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(decode_stamp(&payload), Some(stamp));

        let mut wrong_len = payload;
        wrong_len[0] = 7;
        assert_eq!(decode_stamp(&wrong_len), None);
        assert_eq!(decode_stamp(&payload[..5]), None);
    }
}
