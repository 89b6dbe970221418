//! Chunked AES-256-GCM streaming.
//!
//! Wire layout after the container header:
//! ```text
//! [4 bytes: random salt][chunk 0: ciphertext + 16-byte tag][chunk 1]...
//! nonce = salt(4) || counter(8, big-endian)
//! ```
//! Plaintext chunks are 1 MiB; the final chunk (possibly empty, possibly
//! full-size) sets the counter's high bit so truncation cannot go unnoticed.
//! Every chunk authenticates the caller's AAD, which for STET is the
//! canonical metadata bytes.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use stet_core::{StetError, StetResult};

use crate::dek::Dek;
use crate::TAG_SIZE;

/// Plaintext bytes per chunk.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Random per-blob salt prefixing the ciphertext stream.
pub const SALT_SIZE: usize = 4;

const NONCE_SIZE: usize = 12;
const LAST_CHUNK_FLAG: u64 = 1 << 63;

fn chunk_nonce(salt: &[u8; SALT_SIZE], counter: u64, last: bool) -> [u8; NONCE_SIZE] {
    let counter = if last {
        counter | LAST_CHUNK_FLAG
    } else {
        counter
    };
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..SALT_SIZE].copy_from_slice(salt);
    nonce[SALT_SIZE..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Read until `buf` is full or the reader hits EOF; returns bytes filled.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn next_chunk<R: Read>(reader: &mut R, size: usize) -> StetResult<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let filled = read_full(reader, &mut buf)?;
    buf.truncate(filled);
    Ok(buf)
}

/// Encrypt `reader` to `writer` in chunks, authenticating `aad` with every
/// chunk. Returns the number of plaintext bytes consumed.
pub fn seal_stream<R: Read, W: Write>(
    dek: &Dek,
    aad: &[u8],
    reader: &mut R,
    writer: &mut W,
) -> StetResult<u64> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes())
        .map_err(|e| StetError::AeadFailed(format!("cipher init: {e}")))?;

    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    writer.write_all(&salt)?;

    let mut current = next_chunk(reader, CHUNK_SIZE)?;
    let mut counter = 0u64;
    let mut total = 0u64;

    loop {
        // One chunk of read-ahead tells us whether `current` is the last.
        let next = next_chunk(reader, CHUNK_SIZE)?;
        let last = next.is_empty();

        if counter & LAST_CHUNK_FLAG != 0 {
            return Err(StetError::AeadFailed("chunk counter overflow".into()));
        }
        let nonce = chunk_nonce(&salt, counter, last);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current,
                    aad,
                },
            )
            .map_err(|_| StetError::AeadFailed("chunk encryption failed".into()))?;
        writer.write_all(&sealed)?;

        total += current.len() as u64;
        counter += 1;
        if last {
            return Ok(total);
        }
        current = next;
    }
}

/// Decrypt `reader` to `writer`, releasing each chunk only after its tag
/// verifies. Any tag mismatch, short interior chunk, or missing final-chunk
/// marker fails with `AeadFailed`.
pub fn open_stream<R: Read, W: Write>(
    dek: &Dek,
    aad: &[u8],
    reader: &mut R,
    writer: &mut W,
) -> StetResult<u64> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes())
        .map_err(|e| StetError::AeadFailed(format!("cipher init: {e}")))?;

    let mut salt = [0u8; SALT_SIZE];
    if read_full(reader, &mut salt)? != SALT_SIZE {
        return Err(StetError::AeadFailed("stream ends before salt".into()));
    }

    let frame_size = CHUNK_SIZE + TAG_SIZE;
    let mut current = next_chunk(reader, frame_size)?;
    let mut counter = 0u64;
    let mut total = 0u64;

    loop {
        let next = next_chunk(reader, frame_size)?;
        let last = next.is_empty();

        if current.len() < TAG_SIZE {
            return Err(StetError::AeadFailed("truncated chunk".into()));
        }
        if !last && current.len() != frame_size {
            return Err(StetError::AeadFailed("short interior chunk".into()));
        }

        let nonce = chunk_nonce(&salt, counter, last);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current,
                    aad,
                },
            )
            .map_err(|_| StetError::AeadFailed("chunk authentication failed".into()))?;
        writer.write_all(&plaintext)?;

        total += plaintext.len() as u64;
        counter += 1;
        if last {
            return Ok(total);
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn seal_to_vec(dek: &Dek, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        seal_stream(dek, aad, &mut Cursor::new(plaintext), &mut out).unwrap();
        out
    }

    fn open_to_vec(dek: &Dek, aad: &[u8], stream: &[u8]) -> StetResult<Vec<u8>> {
        let mut out = Vec::new();
        open_stream(dek, aad, &mut Cursor::new(stream), &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_small() {
        let dek = Dek::generate();
        let sealed = seal_to_vec(&dek, b"metadata", b"hello");
        // salt + one chunk of 5 bytes + tag
        assert_eq!(sealed.len(), SALT_SIZE + 5 + TAG_SIZE);
        let opened = open_to_vec(&dek, b"metadata", &sealed).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn test_roundtrip_empty() {
        let dek = Dek::generate();
        let sealed = seal_to_vec(&dek, b"aad", b"");
        assert_eq!(sealed.len(), SALT_SIZE + TAG_SIZE);
        let opened = open_to_vec(&dek, b"aad", &sealed).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let dek = Dek::generate();
        let plaintext = vec![0x5A; CHUNK_SIZE * 2 + CHUNK_SIZE / 2];
        let sealed = seal_to_vec(&dek, b"", &plaintext);
        let opened = open_to_vec(&dek, b"", &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_roundtrip_exact_chunk_boundary() {
        let dek = Dek::generate();
        let plaintext = vec![0xC3; CHUNK_SIZE];
        let sealed = seal_to_vec(&dek, b"", &plaintext);
        // salt + one full frame; the single full chunk carries the last marker
        assert_eq!(sealed.len(), SALT_SIZE + CHUNK_SIZE + TAG_SIZE);
        let opened = open_to_vec(&dek, b"", &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let dek = Dek::generate();
        let sealed = seal_to_vec(&dek, b"right", b"payload");
        assert!(matches!(
            open_to_vec(&dek, b"wrong", &sealed),
            Err(StetError::AeadFailed(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let dek = Dek::generate();
        let sealed = seal_to_vec(&dek, b"", b"payload");
        assert!(open_to_vec(&Dek::generate(), b"", &sealed).is_err());
    }

    #[test]
    fn test_every_bit_flip_fails() {
        let dek = Dek::generate();
        let sealed = seal_to_vec(&dek, b"aad", b"tamper target");
        for byte_idx in 0..sealed.len() {
            for bit in 0..8 {
                let mut corrupt = sealed.clone();
                corrupt[byte_idx] ^= 1 << bit;
                assert!(
                    open_to_vec(&dek, b"aad", &corrupt).is_err(),
                    "flip at byte {byte_idx} bit {bit} accepted"
                );
            }
        }
    }

    #[test]
    fn test_truncated_final_chunk_fails() {
        let dek = Dek::generate();
        let plaintext = vec![1u8; CHUNK_SIZE + 10];
        let sealed = seal_to_vec(&dek, b"", &plaintext);
        // Drop the final (short) frame: the remaining full chunk was sealed
        // without the last marker, so it cannot pass as a final chunk.
        let truncated = &sealed[..SALT_SIZE + CHUNK_SIZE + TAG_SIZE];
        assert!(matches!(
            open_to_vec(&dek, b"", truncated),
            Err(StetError::AeadFailed(_))
        ));
    }

    #[test]
    fn test_truncated_mid_chunk_fails() {
        let dek = Dek::generate();
        let sealed = seal_to_vec(&dek, b"", &vec![2u8; CHUNK_SIZE * 2]);
        let truncated = &sealed[..sealed.len() - 1];
        assert!(open_to_vec(&dek, b"", truncated).is_err());
    }

    #[test]
    fn test_missing_stream_fails() {
        let dek = Dek::generate();
        assert!(open_to_vec(&dek, b"", b"").is_err());
        // salt but no chunks at all
        assert!(open_to_vec(&dek, b"", &[0, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_chunk_reorder_fails() {
        let dek = Dek::generate();
        let plaintext = vec![7u8; CHUNK_SIZE * 3];
        let sealed = seal_to_vec(&dek, b"", &plaintext);

        let frame = CHUNK_SIZE + TAG_SIZE;
        let mut swapped = sealed.clone();
        let (a, b) = (SALT_SIZE, SALT_SIZE + frame);
        let first: Vec<u8> = sealed[a..a + frame].to_vec();
        swapped[a..a + frame].copy_from_slice(&sealed[b..b + frame]);
        swapped[b..b + frame].copy_from_slice(&first);

        assert!(open_to_vec(&dek, b"", &swapped).is_err());
    }
}
