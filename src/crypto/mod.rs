//! Checkpoint signing and key lifecycle.

pub mod key_management;
pub mod signatures;

pub use key_management::{KeyStatus, KeyStore, SigningKeyRecord};
pub use signatures::{Signer, VerificationOutcome, SIGNATURE_ALGORITHM};

use subtle::ConstantTimeEq;

/// Constant-time equality for hex digests and encoded signatures.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
