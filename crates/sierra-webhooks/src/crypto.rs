//! HMAC-SHA256 payload signing.
//!
//! The signature covers the exact bytes put on the wire, so receivers can
//! verify it against the raw request body without re-serializing.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-Sierra-Signature";

/// Signs outbound payloads for destinations that have a secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureSigner;

impl SignatureSigner {
    /// Compute `hex(HMAC-SHA256(secret, payload))`.
    #[must_use]
    pub fn sign(payload: &[u8], secret: &str) -> String {
        hex::encode(Self::mac(payload, secret))
    }

    /// Verify a hex signature using constant-time comparison.
    ///
    /// Malformed hex never verifies.
    #[must_use]
    pub fn verify(expected_hex: &str, payload: &[u8], secret: &str) -> bool {
        let Ok(expected) = hex::decode(expected_hex.trim()) else {
            return false;
        };
        let computed = Self::mac(payload, secret);
        expected.ct_eq(&computed).into()
    }

    fn mac(payload: &[u8], secret: &str) -> Vec<u8> {
        // HMAC accepts keys of any length; new_from_slice never fails for it.
        let mut mac = match <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
