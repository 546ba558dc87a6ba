//! Cryptographic primitives for page validation.
//!
//! Thin wrappers over the RustCrypto stack: PBKDF2-HMAC-SHA512 key
//! derivation, multi-part HMAC-SHA512, and a constant-time comparison.
//! All three agree bit-for-bit with RFC 2898 §5.2 and RFC 2104.

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::error::{ExtractError, ExtractResult};

/// Size of an HMAC-SHA512 digest in bytes.
pub const HMAC_SHA512_SIZE: usize = 64;

/// Derive a 32-byte key with PBKDF2-HMAC-SHA512.
pub fn pbkdf2_sha512(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    pbkdf2_hmac_array::<Sha512, 32>(password, salt, iterations)
}

/// Compute HMAC-SHA512 over a sequence of message parts.
///
/// Feeding disjoint parts avoids concatenating the page body with its
/// trailing page-number bytes before hashing.
///
/// # Errors
///
/// Returns `Internal` if the HMAC context cannot be initialised. This does
/// not happen with a healthy crypto stack; it is surfaced instead of being
/// folded into a false "no match".
pub fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> ExtractResult<[u8; HMAC_SHA512_SIZE]> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .map_err(|e| ExtractError::internal(format!("hmac-sha512 init failed: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time equality of two byte slices.
///
/// Slices of different lengths compare unequal (the length itself is not
/// hidden, only the content comparison is constant-time).
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 4231, test case 1.
    #[test]
    fn test_hmac_sha512_rfc4231_case1() {
        let key = [0x0bu8; 20];
        let digest = hmac_sha512(&key, &[b"Hi There"]).unwrap();
        let expected = hex::decode(
            "87aa7cdea5ef619d4ff0b4241a1d6cb02379f4e2ce4ec2787ad0b30545e17cde\
             daa833b7d6b8a702038b274eaea3f4e4be9d914eeb61f1702e696c203a126854",
        )
        .unwrap();
        assert_eq!(digest.as_slice(), expected.as_slice());
    }

    /// RFC 4231, test case 2 (key shorter than the block size, split message).
    #[test]
    fn test_hmac_sha512_rfc4231_case2_multipart() {
        let digest = hmac_sha512(b"Jefe", &[b"what do ya want ", b"for nothing?"]).unwrap();
        let expected = hex::decode(
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea250554\
             9758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737",
        )
        .unwrap();
        assert_eq!(digest.as_slice(), expected.as_slice());
    }

    /// With one iteration the derived key is exactly
    /// `HMAC(password, salt || INT(1))` per RFC 2898 §5.2.
    #[test]
    fn test_pbkdf2_single_iteration_matches_construction() {
        let derived = pbkdf2_sha512(b"password", b"salt", 1);
        let block = hmac_sha512(b"password", &[b"salt", &1u32.to_be_bytes()]).unwrap();
        assert_eq!(derived.as_slice(), &block[..32]);
    }

    /// Two iterations XOR the first two U values.
    #[test]
    fn test_pbkdf2_two_iterations_matches_construction() {
        let derived = pbkdf2_sha512(b"password", b"salt", 2);
        let u1 = hmac_sha512(b"password", &[b"salt", &1u32.to_be_bytes()]).unwrap();
        let u2 = hmac_sha512(b"password", &[&u1[..]]).unwrap();
        let expected: Vec<u8> = u1.iter().zip(u2.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(derived.as_slice(), &expected[..32]);
    }

    #[test]
    fn test_pbkdf2_deterministic() {
        let a = pbkdf2_sha512(b"secret", b"0123456789abcdef", 16);
        let b = pbkdf2_sha512(b"secret", b"0123456789abcdef", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"same bytes", b"same bytes"));
        assert!(!ct_eq(b"same bytes", b"diff bytes"));
        assert!(!ct_eq(b"short", b"longer slice"));
        assert!(ct_eq(b"", b""));
    }
}
