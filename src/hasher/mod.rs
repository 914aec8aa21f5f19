//! BLAKE3 content digests and the hash worker pool.
//!
//! # Overview
//!
//! Content equality is decided by BLAKE3 digests. Digests are never computed
//! over a whole file in one call: the [`pool`] module owns a fixed set of
//! worker threads, each holding incremental accumulators keyed by
//! (comparison session, file identity). Every chunk fed to an accumulator
//! yields a non-finalizing snapshot of the digest so far, which is what the
//! comparator partitions on.
//!
//! # Example
//!
//! ```
//! use dupewatch::hasher::{hash_to_hex, hex_to_hash, EMPTY_DIGEST};
//!
//! let hex = hash_to_hex(&EMPTY_DIGEST);
//! assert_eq!(hex_to_hash(&hex), Some(EMPTY_DIGEST));
//! ```

pub mod pool;

pub use pool::{AccumulatorKey, HashPool, PendingDigest, PoolError, SessionId, WorkerError};

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Digest of the empty byte stream.
///
/// Every zero-byte file is trivially identical to every other one, so they
/// are assigned this value directly instead of going through the comparator.
pub const EMPTY_DIGEST: Hash = [
    0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc, 0xc9, 0x49,
    0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca, 0xe4, 0x1f, 0x32, 0x62,
];

/// Render a digest as lowercase hex.
#[must_use]
pub fn hash_to_hex(hash: &Hash) -> String {
    blake3::Hash::from(*hash).to_hex().to_string()
}

/// Parse a 64-character hex string back into a digest.
///
/// Returns `None` for anything that is not exactly 32 hex-encoded bytes.
#[must_use]
pub fn hex_to_hash(hex: &str) -> Option<Hash> {
    blake3::Hash::from_hex(hex).ok().map(|h| *h.as_bytes())
}

/// Digest a complete in-memory buffer in one go.
///
/// Only used where the whole content is already at hand (tests, small
/// fixtures); file content always goes through the worker pool.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> Hash {
    *blake3::hash(bytes).as_bytes()
}
