//! Property tests for the characteristic codec

use std::collections::BTreeMap;

use proptest::prelude::*;
use proxima_core::codec::{self, MAX_CHARACTERISTIC_LEN};
use proxima_core::{AdId, Advertisement, EncryptionAlgorithm};

fn key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.-]{1,16}".prop_filter("reserved prefix", |k| !k.starts_with("__"))
}

fn algorithm_strategy() -> impl Strategy<Value = EncryptionAlgorithm> {
    prop_oneof![
        Just(EncryptionAlgorithm::Test),
        Just(EncryptionAlgorithm::Ibe),
        any::<u32>()
            .prop_filter("named codes", |code| !matches!(code, 1 | 2))
            .prop_map(EncryptionAlgorithm::Other),
    ]
}

fn advertisement_strategy() -> impl Strategy<Value = Advertisement> {
    (
        any::<[u8; 16]>().prop_filter("zero id", |id| *id != [0u8; 16]),
        "[a-z./]{1,32}",
        prop::collection::vec("[ -~]{0,24}", 0..4),
        prop::collection::btree_map(key_strategy(), ".{0,32}", 0..6),
        prop::collection::btree_map(key_strategy(), prop::collection::vec(any::<u8>(), 0..64), 0..4),
        prop::option::of((algorithm_strategy(), prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..3))),
        prop::collection::vec("[ -~]{0,24}", 0..3),
    )
        .prop_map(|(id, iface, addresses, attributes, attachments, encryption, dir_addrs)| {
            let mut ad = Advertisement::new(AdId::new(id), iface);
            ad.addresses = addresses;
            ad.attributes = attributes;
            ad.attachments = attachments;
            ad.encryption = encryption.map(|(algorithm, keys)| proxima_core::Encryption { algorithm, keys });
            ad.dir_addrs = dir_addrs;
            ad.with_computed_hash()
        })
}

proptest! {
    #[test]
    fn prop_decode_inverts_encode(ad in advertisement_strategy()) {
        let map = codec::encode(&ad).unwrap();
        prop_assert_eq!(codec::decode(&map), ad);
    }

    #[test]
    fn prop_encode_is_deterministic(ad in advertisement_strategy()) {
        prop_assert_eq!(codec::encode(&ad).unwrap(), codec::encode(&ad.clone()).unwrap());
    }

    #[test]
    fn prop_values_fit_one_characteristic(ad in advertisement_strategy()) {
        let map = codec::encode(&ad).unwrap();
        prop_assert!(map.values().all(|v| v.len() <= MAX_CHARACTERISTIC_LEN));
    }

    #[test]
    fn prop_shadowed_algorithm_codes_rejected(ad in advertisement_strategy(), code in 1u32..=2) {
        let ad = ad.with_encryption(EncryptionAlgorithm::Other(code), vec![]);
        prop_assert!(codec::encode(&ad).is_err());
    }
}

#[test]
fn test_map_ordering_does_not_matter() {
    let mut forward = BTreeMap::new();
    let mut backward = BTreeMap::new();
    for i in 0..10 {
        forward.insert(format!("k{}", i), i.to_string());
    }
    for i in (0..10).rev() {
        backward.insert(format!("k{}", i), i.to_string());
    }

    let mut a = Advertisement::new(AdId::new([3; 16]), "iface");
    a.attributes = forward;
    let mut b = a.clone();
    b.attributes = backward;

    assert_eq!(codec::encode(&a).unwrap(), codec::encode(&b).unwrap());
}
