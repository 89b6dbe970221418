//! Container framing and the canonical metadata encoding.
//!
//! On-disk layout:
//! ```text
//! [magic "STET" | version 0x01 | reserved(3, zero) | metadata_len(u32 LE) | metadata | AEAD stream]
//! ```
//!
//! Metadata is a strict tag-length-value encoding: single-byte tags in fixed
//! ascending order, u32-LE lengths, no unknown fields, no trailing bytes.
//! The bytes written here are fed verbatim to the AEAD as AAD; decrypt reuses
//! the bytes it read instead of re-serialising.

use std::io::{Read, Write};

use stet_core::config::{KekInfo, KeyConfig, KeySplit};
use stet_core::{StetError, StetResult};

pub const MAGIC: [u8; 4] = *b"STET";
pub const VERSION: u8 = 0x01;
pub const MAX_METADATA_LEN: u32 = 16 * 1024 * 1024;

/// A wrapped DEK share and the SHA-256 of its plaintext form. Positional:
/// the i-th wrapped share belongs to the i-th KEK of the key config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedShare {
    pub share: Vec<u8>,
    pub hash: Vec<u8>,
}

/// Everything a decryptor needs besides the ciphertext itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub blob_id: String,
    pub key_config: KeyConfig,
    pub shares: Vec<WrappedShare>,
}

// ── TLV primitives ────────────────────────────────────────────────────────────

fn put_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value);
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    last_tag: u8,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            last_tag: 0,
        }
    }

    /// Next (tag, value) pair. Tags must be non-decreasing, which keeps the
    /// accepted encoding canonical.
    fn next(&mut self) -> StetResult<Option<(u8, &'a [u8])>> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        if self.buf.len() - self.pos < 5 {
            return Err(StetError::MetadataParse("truncated field header".into()));
        }
        let tag = self.buf[self.pos];
        if tag < self.last_tag {
            return Err(StetError::MetadataParse(format!(
                "field {tag} out of order"
            )));
        }
        let len_bytes: [u8; 4] = self.buf[self.pos + 1..self.pos + 5].try_into().unwrap();
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = self.pos + 5;
        let end = start.checked_add(len).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(StetError::MetadataParse(format!(
                "field {tag} overruns buffer"
            )));
        };
        self.pos = end;
        self.last_tag = tag;
        Ok(Some((tag, &self.buf[start..end])))
    }
}

fn utf8(value: &[u8], what: &str) -> StetResult<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| StetError::MetadataParse(format!("{what} is not valid UTF-8")))
}

// ── KekInfo / KeyConfig ──────────────────────────────────────────────────────

const KEK_RSA_FINGERPRINT: u8 = 1;
const KEK_URI: u8 = 2;

fn encode_kek_info(kek: &KekInfo) -> Vec<u8> {
    let mut out = Vec::new();
    match kek {
        KekInfo::RsaFingerprint(fp) => put_field(&mut out, KEK_RSA_FINGERPRINT, fp.as_bytes()),
        KekInfo::KekUri(uri) => put_field(&mut out, KEK_URI, uri.as_bytes()),
    }
    out
}

fn decode_kek_info(buf: &[u8]) -> StetResult<KekInfo> {
    let mut reader = FieldReader::new(buf);
    let kek = match reader.next()? {
        Some((KEK_RSA_FINGERPRINT, value)) => {
            KekInfo::RsaFingerprint(utf8(value, "rsa_fingerprint")?)
        }
        Some((KEK_URI, value)) => KekInfo::KekUri(utf8(value, "kek_uri")?),
        Some((tag, _)) => {
            return Err(StetError::MetadataParse(format!("unknown kek field {tag}")))
        }
        None => return Err(StetError::MetadataParse("empty kek info".into())),
    };
    if reader.next()?.is_some() {
        return Err(StetError::MetadataParse("kek info has extra fields".into()));
    }
    Ok(kek)
}

const SPLIT_NONE: u8 = 1;
const SPLIT_SHAMIR: u8 = 2;
const SHAMIR_SHARES: u8 = 1;
const SHAMIR_THRESHOLD: u8 = 2;

fn encode_split(split: &KeySplit) -> Vec<u8> {
    let mut out = Vec::new();
    match split {
        KeySplit::None => put_field(&mut out, SPLIT_NONE, &[]),
        KeySplit::Shamir { shares, threshold } => {
            let mut body = Vec::new();
            put_field(&mut body, SHAMIR_SHARES, &[*shares]);
            put_field(&mut body, SHAMIR_THRESHOLD, &[*threshold]);
            put_field(&mut out, SPLIT_SHAMIR, &body);
        }
    }
    out
}

fn decode_split(buf: &[u8]) -> StetResult<KeySplit> {
    let mut reader = FieldReader::new(buf);
    let split = match reader.next()? {
        Some((SPLIT_NONE, value)) if value.is_empty() => KeySplit::None,
        Some((SPLIT_SHAMIR, body)) => {
            let mut inner = FieldReader::new(body);
            let shares = match inner.next()? {
                Some((SHAMIR_SHARES, [n])) => *n,
                _ => return Err(StetError::MetadataParse("bad shamir share count".into())),
            };
            let threshold = match inner.next()? {
                Some((SHAMIR_THRESHOLD, [k])) => *k,
                _ => return Err(StetError::MetadataParse("bad shamir threshold".into())),
            };
            if inner.next()?.is_some() {
                return Err(StetError::MetadataParse("shamir has extra fields".into()));
            }
            KeySplit::Shamir { shares, threshold }
        }
        _ => return Err(StetError::MetadataParse("bad split algorithm".into())),
    };
    if reader.next()?.is_some() {
        return Err(StetError::MetadataParse("split has extra fields".into()));
    }
    Ok(split)
}

const CONFIG_KEK_INFO: u8 = 1;
const CONFIG_SPLIT: u8 = 2;

/// Canonical bytes of a key config; also the byte-equality basis for
/// matching a decrypt config against blob metadata.
pub fn encode_key_config(config: &KeyConfig) -> Vec<u8> {
    let mut out = Vec::new();
    for kek in &config.kek_infos {
        put_field(&mut out, CONFIG_KEK_INFO, &encode_kek_info(kek));
    }
    put_field(&mut out, CONFIG_SPLIT, &encode_split(&config.split));
    out
}

fn decode_key_config(buf: &[u8]) -> StetResult<KeyConfig> {
    let mut reader = FieldReader::new(buf);
    let mut kek_infos = Vec::new();
    let mut split = None;
    while let Some((tag, value)) = reader.next()? {
        match tag {
            CONFIG_KEK_INFO => {
                if split.is_some() {
                    return Err(StetError::MetadataParse("kek info after split".into()));
                }
                kek_infos.push(decode_kek_info(value)?);
            }
            CONFIG_SPLIT => {
                if split.is_some() {
                    return Err(StetError::MetadataParse("duplicate split field".into()));
                }
                split = Some(decode_split(value)?);
            }
            _ => {
                return Err(StetError::MetadataParse(format!(
                    "unknown key config field {tag}"
                )))
            }
        }
    }
    let Some(split) = split else {
        return Err(StetError::MetadataParse("key config missing split".into()));
    };
    if kek_infos.is_empty() {
        return Err(StetError::MetadataParse("key config has no KEKs".into()));
    }
    Ok(KeyConfig { kek_infos, split })
}

// ── WrappedShare / Metadata ──────────────────────────────────────────────────

const SHARE_BYTES: u8 = 1;
const SHARE_HASH: u8 = 2;

fn encode_wrapped_share(share: &WrappedShare) -> Vec<u8> {
    let mut out = Vec::new();
    put_field(&mut out, SHARE_BYTES, &share.share);
    put_field(&mut out, SHARE_HASH, &share.hash);
    out
}

fn decode_wrapped_share(buf: &[u8]) -> StetResult<WrappedShare> {
    let mut reader = FieldReader::new(buf);
    let share = match reader.next()? {
        Some((SHARE_BYTES, value)) => value.to_vec(),
        _ => return Err(StetError::MetadataParse("wrapped share missing bytes".into())),
    };
    let hash = match reader.next()? {
        Some((SHARE_HASH, value)) => value.to_vec(),
        _ => return Err(StetError::MetadataParse("wrapped share missing hash".into())),
    };
    if reader.next()?.is_some() {
        return Err(StetError::MetadataParse(
            "wrapped share has extra fields".into(),
        ));
    }
    Ok(WrappedShare { share, hash })
}

const META_BLOB_ID: u8 = 1;
const META_KEY_CONFIG: u8 = 2;
const META_SHARE: u8 = 3;

/// Canonical metadata bytes. Deterministic: identical input always yields
/// identical bytes.
pub fn encode_metadata(metadata: &Metadata) -> Vec<u8> {
    let mut out = Vec::new();
    put_field(&mut out, META_BLOB_ID, metadata.blob_id.as_bytes());
    put_field(&mut out, META_KEY_CONFIG, &encode_key_config(&metadata.key_config));
    for share in &metadata.shares {
        put_field(&mut out, META_SHARE, &encode_wrapped_share(share));
    }
    out
}

/// Strict decode of canonical metadata bytes.
pub fn decode_metadata(buf: &[u8]) -> StetResult<Metadata> {
    let mut reader = FieldReader::new(buf);

    let blob_id = match reader.next()? {
        Some((META_BLOB_ID, value)) => utf8(value, "blob_id")?,
        _ => return Err(StetError::MetadataParse("metadata missing blob_id".into())),
    };
    let key_config = match reader.next()? {
        Some((META_KEY_CONFIG, value)) => decode_key_config(value)?,
        _ => {
            return Err(StetError::MetadataParse(
                "metadata missing key config".into(),
            ))
        }
    };
    let mut shares = Vec::new();
    while let Some((tag, value)) = reader.next()? {
        if tag != META_SHARE {
            return Err(StetError::MetadataParse(format!(
                "unknown metadata field {tag}"
            )));
        }
        shares.push(decode_wrapped_share(value)?);
    }

    if shares.len() != key_config.kek_infos.len() {
        return Err(StetError::MetadataParse(format!(
            "{} wrapped shares for {} KEKs",
            shares.len(),
            key_config.kek_infos.len()
        )));
    }

    Ok(Metadata {
        blob_id,
        key_config,
        shares,
    })
}

// ── Blob header ──────────────────────────────────────────────────────────────

/// Writes magic, version, reserved bytes, length, and the metadata itself.
pub fn write_blob_header<W: Write>(writer: &mut W, metadata_bytes: &[u8]) -> StetResult<()> {
    if metadata_bytes.len() > MAX_METADATA_LEN as usize {
        return Err(StetError::MetadataTooLarge(metadata_bytes.len() as u64));
    }
    writer.write_all(&MAGIC)?;
    writer.write_all(&[VERSION, 0, 0, 0])?;
    writer.write_all(&(metadata_bytes.len() as u32).to_le_bytes())?;
    writer.write_all(metadata_bytes)?;
    Ok(())
}

/// Reads and checks the header, returning the raw metadata bytes exactly as
/// stored (the decryptor feeds these to the AEAD as AAD).
pub fn read_blob_header<R: Read>(reader: &mut R) -> StetResult<Vec<u8>> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| StetError::BadMagic)?;
    if magic != MAGIC {
        return Err(StetError::BadMagic);
    }

    let mut version_and_reserved = [0u8; 4];
    reader
        .read_exact(&mut version_and_reserved)
        .map_err(|_| StetError::MetadataParse("truncated header".into()))?;
    if version_and_reserved[0] != VERSION {
        return Err(StetError::UnsupportedVersion(version_and_reserved[0]));
    }
    if version_and_reserved[1..] != [0, 0, 0] {
        return Err(StetError::MetadataParse("reserved bytes not zero".into()));
    }

    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|_| StetError::MetadataParse("truncated header".into()))?;
    let metadata_len = u32::from_le_bytes(len_bytes);
    if metadata_len > MAX_METADATA_LEN {
        return Err(StetError::MetadataTooLarge(metadata_len as u64));
    }

    let mut metadata = vec![0u8; metadata_len as usize];
    reader
        .read_exact(&mut metadata)
        .map_err(|_| StetError::MetadataParse("truncated metadata".into()))?;
    Ok(metadata)
}
