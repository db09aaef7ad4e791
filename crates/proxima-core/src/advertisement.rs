//! The advertisement data model
//!
//! An [`Advertisement`] is what an application publishes and what subscribers
//! receive about peers. It maps one-to-one onto a GATT service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{AdHash, AdId};

// ----------------------------------------------------------------------------
// Encryption Metadata
// ----------------------------------------------------------------------------

/// Algorithm used to encrypt advertisement content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    /// Test-only scheme
    Test,
    /// Identity-based encryption
    Ibe,
    /// Algorithm code this implementation does not know
    Other(u32),
}

impl EncryptionAlgorithm {
    /// Numeric code carried on the wire
    pub fn code(&self) -> u32 {
        match self {
            Self::Test => 1,
            Self::Ibe => 2,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Test,
            2 => Self::Ibe,
            other => Self::Other(other),
        }
    }
}

/// Encryption metadata attached to an advertisement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Encryption {
    pub algorithm: EncryptionAlgorithm,
    pub keys: Vec<Vec<u8>>,
}

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// A named entity advertised by a device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Advertisement {
    /// Opaque identifier, stable across updates of the same entity
    pub id: AdId,
    /// Interface or type name subscribers filter on
    pub interface_name: String,
    /// Network addresses where the entity can be reached
    pub addresses: Vec<String>,
    /// Free-form string attributes
    pub attributes: BTreeMap<String, String>,
    /// Binary attachments
    pub attachments: BTreeMap<String, Vec<u8>>,
    /// Optional encryption metadata
    pub encryption: Option<Encryption>,
    /// Addresses of directory servers holding the full advertisement
    pub dir_addrs: Vec<String>,
    /// Digest over the content; two advertisements with the same id and hash
    /// are treated as the same advertisement
    pub hash: AdHash,
    /// Set only when the advertisement is reported as withdrawn
    pub lost: bool,
}

impl Advertisement {
    /// Create an advertisement with the given id and interface name
    pub fn new(id: AdId, interface_name: impl Into<String>) -> Self {
        Self {
            id,
            interface_name: interface_name.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn with_encryption(mut self, algorithm: EncryptionAlgorithm, keys: Vec<Vec<u8>>) -> Self {
        self.encryption = Some(Encryption { algorithm, keys });
        self
    }

    pub fn with_dir_addr(mut self, address: impl Into<String>) -> Self {
        self.dir_addrs.push(address.into());
        self
    }

    /// Replace the hash with one computed from the current content
    pub fn with_computed_hash(mut self) -> Self {
        self.hash = self.compute_hash();
        self
    }

    /// Identity used when diffing advertisement sets
    pub fn key(&self) -> (AdId, AdHash) {
        (self.id, self.hash)
    }

    /// A copy of this advertisement marked as withdrawn
    pub fn as_lost(&self) -> Self {
        Self {
            lost: true,
            ..self.clone()
        }
    }

    /// Compute the content hash
    ///
    /// SHA-256 over length-prefixed content fields, truncated to 8 bytes.
    /// Maps are hashed in key order, so the result does not depend on
    /// insertion order. `hash` and `lost` are not part of the content.
    pub fn compute_hash(&self) -> AdHash {
        let mut hasher = Sha256::new();

        fn field(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }

        field(&mut hasher, self.id.as_bytes());
        field(&mut hasher, self.interface_name.as_bytes());

        hasher.update((self.addresses.len() as u64).to_be_bytes());
        for address in &self.addresses {
            field(&mut hasher, address.as_bytes());
        }

        hasher.update((self.attributes.len() as u64).to_be_bytes());
        for (key, value) in &self.attributes {
            field(&mut hasher, key.as_bytes());
            field(&mut hasher, value.as_bytes());
        }

        hasher.update((self.attachments.len() as u64).to_be_bytes());
        for (key, value) in &self.attachments {
            field(&mut hasher, key.as_bytes());
            field(&mut hasher, value);
        }

        match &self.encryption {
            Some(encryption) => {
                hasher.update(encryption.algorithm.code().to_be_bytes());
                hasher.update((encryption.keys.len() as u64).to_be_bytes());
                for key in &encryption.keys {
                    field(&mut hasher, key);
                }
            }
            None => hasher.update(0u32.to_be_bytes()),
        }

        hasher.update((self.dir_addrs.len() as u64).to_be_bytes());
        for address in &self.dir_addrs {
            field(&mut hasher, address.as_bytes());
        }

        let digest = hasher.finalize();
        let mut truncated = [0u8; AdHash::LEN];
        truncated.copy_from_slice(&digest[..AdHash::LEN]);
        AdHash::new(truncated)
    }

    /// True if this advertisement passes an interface-name filter
    ///
    /// The empty filter matches everything.
    pub fn matches(&self, interface_filter: &str) -> bool {
        interface_filter.is_empty() || self.interface_name == interface_filter
    }
}
