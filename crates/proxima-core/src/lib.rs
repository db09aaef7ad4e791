//! Proxima Core
//!
//! Platform-independent pieces of the Proxima BLE discovery engine: the
//! advertisement model, the codec that maps advertisements onto GATT
//! characteristics, and the time-bounded peer cache that turns fetch results
//! into add/remove events for subscribers.
//!
//! Nothing in this crate performs I/O; the radio-facing engine lives in
//! `proxima-ble`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod advertisement;
pub mod cache;
pub mod codec;
pub mod config;
pub mod errors;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertisement::{Advertisement, Encryption, EncryptionAlgorithm};
pub use cache::{CacheDelta, CacheStats, Handler, PeerCache, ScanHandler};
pub use codec::{decode, encode, CharacteristicMap};
pub use config::CacheConfig;
pub use errors::{CacheError, CodecError, Result};
pub use types::{AdHash, AdId, RadioId, Stamp, SystemTimeSource, TimeSource, Timestamp};
