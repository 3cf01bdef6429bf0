//! Tagged messages and the serializable closure form.
//!
//! A [`Message`] is the unit every mailbox and channel queue holds: a type
//! fingerprint plus the postcard-encoded payload. Decoding never happens
//! speculatively; a consumer states the type it expects and the fingerprint
//! gate decides whether decoding is even attempted.

use crate::{Fingerprint, Remotable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors from packing or unpacking a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload serialization failed.
    #[error("encode failed: {0}")]
    Encode(postcard::Error),
    /// Payload deserialization failed under a matching fingerprint.
    ///
    /// This is a programmer error: two types with the same name but
    /// different shapes, or corrupted bytes.
    #[error("decode failed: {0}")]
    Decode(postcard::Error),
    /// The message's fingerprint does not match the expected type.
    #[error("fingerprint mismatch: expected {expected}, got {found}")]
    FingerprintMismatch {
        /// The fingerprint of the type the caller asked for.
        expected: Fingerprint,
        /// The fingerprint carried by the message.
        found: Fingerprint,
    },
}

/// A type-tagged, opaque payload.
#[derive(Clone, Serialize, Deserialize)]
pub struct Message {
    fingerprint: Fingerprint,
    bytes: Vec<u8>,
}

impl Message {
    /// Encodes a value into a tagged message.
    pub fn pack<T: Remotable>(value: &T) -> Result<Self, CodecError> {
        let bytes = postcard::to_allocvec(value).map_err(CodecError::Encode)?;
        Ok(Self {
            fingerprint: T::fingerprint(),
            bytes,
        })
    }

    /// Decodes the payload as `T`, gated on the fingerprint.
    pub fn unpack<T: Remotable>(&self) -> Result<T, CodecError> {
        let expected = T::fingerprint();
        if self.fingerprint != expected {
            return Err(CodecError::FingerprintMismatch {
                expected,
                found: self.fingerprint,
            });
        }
        postcard::from_bytes(&self.bytes).map_err(CodecError::Decode)
    }

    /// Returns `true` if the payload is a `T`.
    #[inline]
    pub fn is<T: Remotable>(&self) -> bool {
        self.fingerprint == T::fingerprint()
    }

    /// Reassembles a message from wire parts.
    pub fn from_parts(fingerprint: Fingerprint, bytes: Vec<u8>) -> Self {
        Self { fingerprint, bytes }
    }

    /// Returns the type fingerprint.
    #[inline]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Splits the message into wire parts.
    pub fn into_parts(self) -> (Fingerprint, Vec<u8>) {
        (self.fingerprint, self.bytes)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("fingerprint", &self.fingerprint)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// The serializable form of a closure: a static label plus an encoded
/// environment.
///
/// The label is resolved against the receiving node's remote table; the
/// environment is whatever the registered resolver expects. Labels must be
/// deterministic strings agreed on by every node in a deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawClosure {
    /// The resolution label.
    pub label: String,
    /// The postcard-encoded environment.
    pub env: Vec<u8>,
}

impl RawClosure {
    /// Creates a raw closure from a label and an already-encoded environment.
    pub fn new(label: impl Into<String>, env: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let msg = Message::pack(&42i64).unwrap();
        assert!(msg.is::<i64>());
        assert_eq!(msg.unpack::<i64>().unwrap(), 42);
    }

    #[test]
    fn test_unpack_wrong_type() {
        let msg = Message::pack(&42i64).unwrap();
        assert!(!msg.is::<String>());
        match msg.unpack::<String>() {
            Err(CodecError::FingerprintMismatch { .. }) => {}
            other => panic!("expected fingerprint mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_parts_roundtrip() {
        let msg = Message::pack(&"hello".to_string()).unwrap();
        let (fp, bytes) = msg.into_parts();
        let back = Message::from_parts(fp, bytes);
        assert_eq!(back.unpack::<String>().unwrap(), "hello");
    }
}
