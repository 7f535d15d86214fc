//! Request fingerprinting.
//!
//! A digest binds an idempotency key to the request it was first used with.
//! A later request under the same key with a different digest is a client
//! bug, not a retry.
//!
//! Each field is hashed as `len (u64, big-endian) || bytes`, in the order
//! method, path, body. The length prefix keeps `("POST", "/ab", "c")` and
//! `("POST", "/a", "bc")` apart, which a plain concatenation would not.

use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Width of a request digest in bytes (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// A stored digest had the wrong number of bytes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid digest length: expected {DIGEST_LEN} bytes, found {0}")]
pub struct DigestLengthError(pub usize);

/// Fixed-width fingerprint of `(method, path, body)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestDigest([u8; DIGEST_LEN]);

impl RequestDigest {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Rebuild a digest read back from storage.
    ///
    /// # Errors
    ///
    /// Returns [`DigestLengthError`] if `bytes` is not exactly [`DIGEST_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DigestLengthError> {
        <[u8; DIGEST_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| DigestLengthError(bytes.len()))
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for RequestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RequestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestDigest({self})")
    }
}

/// Compute the digest of a request.
///
/// The method is upper-cased first so `post` and `POST` fingerprint alike.
///
/// # Example
///
/// ```
/// use idempotency_core::digest;
///
/// let a = digest("POST", "/orders", br#"{"x":1}"#);
/// let b = digest("POST", "/orders", br#"{"x":2}"#);
/// assert_ne!(a, b);
/// assert_eq!(a, digest("post", "/orders", br#"{"x":1}"#));
/// ```
#[must_use]
pub fn digest(method: &str, path: &str, body: &[u8]) -> RequestDigest {
    let method = method.to_ascii_uppercase();
    let mut hasher = Sha256::new();

    for part in [method.as_bytes(), path.as_bytes(), body] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }

    RequestDigest(hasher.finalize().into())
}
