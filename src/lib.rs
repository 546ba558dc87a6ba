//! keysweep: recover a live messaging client's database master key.
//!
//! The client encrypts its message store with a SQLCipher-style "V4"
//! format (PBKDF2-HMAC-SHA512, 256000 iterations, per-page HMAC-SHA512).
//! While the client runs, the 32-byte master key sits in its writable
//! memory inside a structure with a recognisable footprint. This crate:
//!
//! - enumerates and snapshots the candidate memory regions of the target
//!   process (`/proc` on Linux, task ports on macOS),
//! - sweeps the snapshots for the key structure's anchor pattern,
//! - checks every candidate against the first page of the encrypted
//!   database, which authenticates itself under the true key,
//! - returns the first validated key as 64 hex characters.
//!
//! # Example
//!
//! ```rust,ignore
//! use keysweep::{extract, CancelToken};
//!
//! let first_page: [u8; 4096] = read_first_page("messages.db")?;
//! let key = extract(client_pid, &first_page, &CancelToken::new())?;
//! println!("{key}");
//! ```
//!
//! Reading a foreign process requires the usual OS privilege (ptrace
//! capability on Linux, a task-port entitlement on macOS). The target is
//! never written to.

pub mod backend;
pub mod cancel;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod region;
pub mod scanner;
pub mod validator;

// Re-export the surface most callers need.
pub use backend::{select_backend, MemoryBackend, RegionReader, UnsupportedBackend};
pub use cancel::CancelToken;
pub use error::{ExtractError, ExtractResult};
pub use pipeline::{extract, extract_with_backend, KeyFinding, Strategy};
pub use region::{MemoryRegion, Protection, RegionBuffer, RegionClass};
pub use validator::{Validator, KEY_SIZE, PAGE_SIZE};
