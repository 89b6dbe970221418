//! Secret buffers: the DEK and its shares. Both are zeroized on drop and
//! redact their contents from `Debug` output.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::DEK_SIZE;

/// A 256-bit data encryption key. Lives only in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; DEK_SIZE]);

impl Dek {
    /// Generate a fresh DEK from the system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEK_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DEK_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != DEK_SIZE {
            return None;
        }
        let mut bytes = [0u8; DEK_SIZE];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DEK_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dek").field("bytes", &"[REDACTED]").finish()
    }
}

/// One piece of a split DEK. For Shamir splits this is `[x, y_0..y_31]`;
/// for no-split it is the DEK itself.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Share(Vec<u8>);

impl Share {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Share {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("len", &self.0.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
