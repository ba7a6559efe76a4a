//! Wire schema for CRDT delta dissemination.
//!
//! Every delta leaving a coordinator travels as a bincode-encoded
//! [`DeltaEnvelope`]:
//! ```text
//! ┌─────────────┬──────────┬──────────┐
//! │ document_id │ origin   │ payload  │
//! │ ≤100 chars  │ ≤50 chars│ ≤1 MiB   │
//! └─────────────┴──────────┴──────────┘
//! ```
//!
//! Receivers must call [`DeltaEnvelope::validate`] before touching the
//! document: identifiers become storage path segments and channel names, so
//! the pattern check here is a security boundary, not a formality.

use serde::{Deserialize, Serialize};

/// Maximum length of a document identifier on the wire.
pub const MAX_DOCUMENT_ID_LEN: usize = 100;

/// Maximum length of the origin tag (a replica id string).
pub const MAX_ORIGIN_LEN: usize = 50;

/// Maximum delta payload accepted from the channel (1 MiB).
///
/// Deltas are incremental; anything near this bound is either a bug or an
/// attack, and is dropped before decode.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Hard ceiling on a full encoded document snapshot (8 MiB).
///
/// Enforced before a local flush is accepted, bounding worst-case storage
/// and broadcast cost per document.
pub const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

/// Check that an identifier is safe to embed in paths and channel names.
///
/// Allowed: ASCII alphanumerics, hyphen, underscore. Rejects empty strings
/// and anything over `max_len`. The same check guards coordinator
/// construction, channel naming, and storage path segments.
pub fn validate_identifier(id: &str, max_len: usize) -> Result<(), ProtocolError> {
    if id.is_empty() || id.len() > max_len {
        return Err(ProtocolError::InvalidIdentifier(id.to_string()));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(ProtocolError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

/// A single CRDT delta in flight between replicas.
///
/// `origin` is the sending coordinator's replica id; a receiver that sees
/// its own replica id is looking at its own echo and must ignore it.
/// Envelopes are transient — they are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaEnvelope {
    pub document_id: String,
    pub origin: String,
    /// Encoded CRDT update bytes (opaque to this layer).
    pub payload: Vec<u8>,
}

impl DeltaEnvelope {
    pub fn new(document_id: impl Into<String>, origin: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            document_id: document_id.into(),
            origin: origin.into(),
            payload,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    ///
    /// A successful decode does NOT mean the envelope is acceptable —
    /// callers must still run [`validate`](Self::validate).
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(envelope)
    }

    /// Enforce the wire schema bounds.
    ///
    /// Must pass before the payload is handed to the document layer.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_identifier(&self.document_id, MAX_DOCUMENT_ID_LEN)?;
        if self.origin.is_empty() || self.origin.len() > MAX_ORIGIN_LEN {
            return Err(ProtocolError::InvalidOrigin(self.origin.len()));
        }
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(())
    }
}

/// Wire protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Identifier failed the safe-pattern check.
    InvalidIdentifier(String),
    /// Origin tag empty or over length bound (length carried).
    InvalidOrigin(usize),
    /// Payload exceeds the wire bound.
    PayloadTooLarge { size: usize, max: usize },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidIdentifier(id) => write!(f, "Invalid identifier: {id:?}"),
            Self::InvalidOrigin(len) => write!(f, "Invalid origin tag (length {len})"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "Payload too large: {size} bytes (max {max})")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
