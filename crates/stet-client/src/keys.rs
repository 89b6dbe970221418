//! Locally held RSA KEKs: PEM scanning, SPKI fingerprinting, and OAEP
//! wrap/unwrap.
//!
//! A fingerprint is base64(SHA-256(DER SubjectPublicKeyInfo)). Public keys
//! are PEM "PUBLIC KEY" (SPKI); private keys are PEM "RSA PRIVATE KEY"
//! (PKCS#1). The first file whose fingerprint matches wins.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use stet_core::config::AsymmetricKeys;
use stet_core::{StetError, StetResult};

/// base64(SHA-256(DER SPKI)) of a public key.
pub fn fingerprint(public_key: &RsaPublicKey) -> StetResult<String> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| StetError::ConfigInvalid(format!("encoding public key: {e}")))?;
    Ok(STANDARD.encode(Sha256::digest(der.as_bytes())))
}

/// Scans the configured public-key files for one matching `want`.
pub fn public_key_for_fingerprint(
    keys: &AsymmetricKeys,
    want: &str,
) -> StetResult<RsaPublicKey> {
    for path in &keys.public_key_files {
        let pem = std::fs::read_to_string(path)?;
        let key = RsaPublicKey::from_public_key_pem(&pem).map_err(|e| {
            StetError::ConfigInvalid(format!("parsing public key {}: {e}", path.display()))
        })?;
        if fingerprint(&key)? == want {
            return Ok(key);
        }
    }
    Err(StetError::NoMatchingRsaKey(want.to_string()))
}

/// Scans the configured private-key files for one whose public half
/// matches `want`.
pub fn private_key_for_fingerprint(
    keys: &AsymmetricKeys,
    want: &str,
) -> StetResult<RsaPrivateKey> {
    for path in &keys.private_key_files {
        let pem = std::fs::read_to_string(path)?;
        let key = RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| {
            StetError::ConfigInvalid(format!("parsing private key {}: {e}", path.display()))
        })?;
        if fingerprint(&key.to_public_key())? == want {
            return Ok(key);
        }
    }
    Err(StetError::NoMatchingRsaKey(want.to_string()))
}

/// RSA-OAEP(SHA-256, MGF1-SHA-256, no label) wrap of a share.
pub fn wrap_share(public_key: &RsaPublicKey, share: &[u8]) -> StetResult<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), share)
        .map_err(|e| StetError::Other(anyhow::anyhow!("RSA-OAEP wrap: {e}")))
}

/// RSA-OAEP unwrap of a share.
pub fn unwrap_share(private_key: &RsaPrivateKey, wrapped: &[u8]) -> StetResult<Vec<u8>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| StetError::Other(anyhow::anyhow!("RSA-OAEP unwrap: {e}")))
}
