//! Error types for the discovery core
//!
//! Codec errors name the field they concern so a rejected publish can be
//! traced back to the offending part of the advertisement.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors produced while converting advertisements to and from characteristics
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("cannot encode field `{field}`: {reason}")]
    Encode { field: String, reason: String },

    #[error("cannot decode field `{field}`: {reason}")]
    Decode { field: &'static str, reason: String },
}

impl CodecError {
    pub(crate) fn encode(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encode {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by the peer cache
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("scan handler is already subscribed")]
    DuplicateSubscription,
}

pub type Result<T> = core::result::Result<T, CodecError>;
