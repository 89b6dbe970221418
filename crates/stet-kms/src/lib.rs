//! Cloud KMS backend: remote wrap/unwrap of DEK shares with CRC32C
//! (Castagnoli) integrity guards on both directions, plus KEK metadata
//! resolution and caching.

pub mod client;
pub mod resolve;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{unwrap_share, wrap_share, CloudKms, KmsGrpcClient, LazyKmsClient};
pub use resolve::{KekMetadata, KekProtection, KekResolver};
