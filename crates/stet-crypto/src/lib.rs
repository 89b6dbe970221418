//! stet-crypto: DEK lifecycle and on-disk format for STET
//!
//! Pipeline: DEK → Shamir split → per-share KEK wrap (elsewhere) → metadata →
//! container header → chunked AES-256-GCM stream with the canonical metadata
//! bytes as AAD.
//!
//! ```text
//! [ "STET" | 0x01 | reserved(3) | metadata_len(u32 LE) | metadata | salt(4) | chunks... ]
//! chunk nonce = salt(4) || counter(8, big-endian); final chunk sets the counter's high bit
//! ```

pub mod aead;
pub mod container;
pub mod dek;
pub mod shares;

pub use aead::{open_stream, seal_stream};
pub use container::{Metadata, WrappedShare};
pub use dek::{Dek, Share};
pub use shares::{combine, hash_share, split, validate_share};

/// Size of a DEK in bytes (256-bit)
pub const DEK_SIZE: usize = 32;

/// Size of a SHA-256 share hash
pub const SHARE_HASH_SIZE: usize = 32;

/// Size of an AES-GCM authentication tag
pub const TAG_SIZE: usize = 16;
