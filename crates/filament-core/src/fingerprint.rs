//! Type fingerprints.
//!
//! A [`Fingerprint`] is a stable digest of a payload's static type. Every
//! message on the wire carries one, and decoding is only attempted when a
//! receiver's expected fingerprint equals the message's. This is what lets a
//! mailbox hold heterogeneous payloads without dynamic typing: an unmatched
//! fingerprint is simply not our message.
//!
//! The digest is the first 16 bytes of SHA-256 over the fully qualified type
//! name, so it is stable within a deployment built from one source tree.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any;
use std::fmt;

/// A stable digest of a static payload type.
///
/// Equal iff the types are equal; collision resistance comes from SHA-256.
///
/// # Examples
///
/// ```
/// use filament_core::Fingerprint;
///
/// assert_eq!(Fingerprint::of::<u64>(), Fingerprint::of::<u64>());
/// assert_ne!(Fingerprint::of::<u64>(), Fingerprint::of::<String>());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Returns the fingerprint of type `T`.
    pub fn of<T: 'static>() -> Self {
        Self::from_name(any::type_name::<T>())
    }

    /// Digests an explicit type name.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }

    /// Returns the raw digest bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A payload type that can cross node boundaries.
///
/// Blanket-implemented for every `Serialize + DeserializeOwned + Send +
/// 'static` type; user code never implements it by hand. The associated
/// fingerprint gates decoding on the receiving side.
pub trait Remotable: Serialize + DeserializeOwned + Send + 'static {
    /// The fingerprint of this type.
    fn fingerprint() -> Fingerprint {
        Fingerprint::of::<Self>()
    }
}

impl<T> Remotable for T where T: Serialize + DeserializeOwned + Send + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_iff_same_type() {
        assert_eq!(Fingerprint::of::<i64>(), Fingerprint::of::<i64>());
        assert_ne!(Fingerprint::of::<i64>(), Fingerprint::of::<u64>());
        assert_ne!(Fingerprint::of::<String>(), Fingerprint::of::<Vec<u8>>());
    }

    #[test]
    fn test_generic_instantiations_differ() {
        assert_ne!(
            Fingerprint::of::<Vec<i64>>(),
            Fingerprint::of::<Vec<String>>()
        );
    }

    #[test]
    fn test_display_is_hex() {
        let fp = Fingerprint::of::<u8>();
        let text = format!("{}", fp);
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_serialization() {
        let fp = Fingerprint::of::<String>();
        let bytes = postcard::to_allocvec(&fp).unwrap();
        let decoded: Fingerprint = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(fp, decoded);
    }
}
