//! Key-validation oracle for the V4 database format.
//!
//! The first page of a V4 database authenticates itself: the trailing 64
//! bytes are an HMAC-SHA512 over the page body plus the little-endian page
//! number, keyed by a value derived from the master key. [`Validator`]
//! captures one first page and answers, for any 32-byte candidate, whether
//! it is the master key that produced that HMAC.

use crate::crypto::{ct_eq, hmac_sha512, pbkdf2_sha512};
use crate::error::ExtractResult;

/// Size of a V4 database page.
pub const PAGE_SIZE: usize = 4096;
/// Size of the salt stored at the head of the first page.
pub const SALT_SIZE: usize = 16;
/// Size of the master key and of both derived keys.
pub const KEY_SIZE: usize = 32;
/// Size of the per-page initialization vector.
pub const IV_SIZE: usize = 16;
/// Size of the per-page HMAC-SHA512 check value.
pub const HMAC_SIZE: usize = 64;
/// PBKDF2 iteration count for the encryption key.
pub const KDF_ITER: u32 = 256_000;
/// PBKDF2 iteration count for the MAC key.
const MAC_KDF_ITER: u32 = 2;
/// XOR mask applied to the salt to form the MAC salt.
const MAC_SALT_XOR: u8 = 0x3A;
/// AES block size, the granularity the page reserve is rounded to.
const BLOCK_SIZE: usize = 16;

/// Trailing per-page overhead: IV + HMAC, rounded up to a block multiple.
pub const RESERVE: usize = (IV_SIZE + HMAC_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
/// End of the HMAC-covered body; the stored HMAC starts here.
pub const DATA_END: usize = PAGE_SIZE - RESERVE + IV_SIZE;

const _: () = assert!(RESERVE == 80);
const _: () = assert!(DATA_END == 4032);

/// The key oracle built from one database first page.
///
/// Construction copies the page; `validate` is pure and the oracle carries
/// no mutable state, so one instance is shared read-only by every scan
/// worker.
pub struct Validator {
    page: Box<[u8; PAGE_SIZE]>,
    salt: [u8; SALT_SIZE],
    encrypted: bool,
}

impl Validator {
    /// Build an oracle from the first 4096 bytes of the database file.
    pub fn new(first_page: &[u8; PAGE_SIZE]) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&first_page[..SALT_SIZE]);
        Validator {
            page: Box::new(*first_page),
            encrypted: salt != [0u8; SALT_SIZE],
            salt,
        }
    }

    /// Whether the captured page belongs to an encrypted database.
    ///
    /// An all-zero salt means plaintext; `validate` then returns `false`
    /// for every candidate and the pipeline short-circuits with
    /// [`DatabaseNotEncrypted`](crate::ExtractError::DatabaseNotEncrypted).
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Check one candidate master key against the page HMAC.
    ///
    /// # Errors
    ///
    /// Only on crypto-stack failure (`Internal`); a wrong key is `Ok(false)`.
    pub fn try_validate(&self, key: &[u8; KEY_SIZE]) -> ExtractResult<bool> {
        if !self.encrypted {
            return Ok(false);
        }

        let enc_key = pbkdf2_sha512(key, &self.salt, KDF_ITER);

        let mut mac_salt = self.salt;
        for b in &mut mac_salt {
            *b ^= MAC_SALT_XOR;
        }
        let mac_key = pbkdf2_sha512(&enc_key, &mac_salt, MAC_KDF_ITER);

        // The HMAC covers the body after the salt up to the stored check
        // value, followed by the page number (first page = 1, LE32).
        let digest = hmac_sha512(
            &mac_key,
            &[&self.page[SALT_SIZE..DATA_END], &1u32.to_le_bytes()],
        )?;

        Ok(ct_eq(&digest, &self.page[DATA_END..DATA_END + HMAC_SIZE]))
    }

    /// `bool` convenience over [`try_validate`](Self::try_validate); a
    /// crypto-stack failure is logged and reported as a non-match.
    pub fn validate(&self, key: &[u8; KEY_SIZE]) -> bool {
        match self.try_validate(key) {
            Ok(hit) => hit,
            Err(err) => {
                tracing::error!(%err, "key validation failed");
                false
            }
        }
    }
}

/// Build a synthetic first page that validates under `key`.
///
/// The page body is `fill` throughout; the trailing HMAC is stamped from
/// the derivation chain a real database would use.
#[cfg(test)]
pub(crate) fn synthetic_page(salt: &[u8; SALT_SIZE], key: &[u8; KEY_SIZE], fill: u8) -> [u8; PAGE_SIZE] {
    let mut page = [fill; PAGE_SIZE];
    page[..SALT_SIZE].copy_from_slice(salt);

    let enc_key = pbkdf2_sha512(key, salt, KDF_ITER);
    let mac_salt: Vec<u8> = salt.iter().map(|b| b ^ MAC_SALT_XOR).collect();
    let mac_key = pbkdf2_sha512(&enc_key, &mac_salt, MAC_KDF_ITER);
    let digest = hmac_sha512(&mac_key, &[&page[SALT_SIZE..DATA_END], &1u32.to_le_bytes()])
        .expect("hmac");
    page[DATA_END..DATA_END + HMAC_SIZE].copy_from_slice(&digest);
    page
}
