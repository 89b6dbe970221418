use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{StetError, StetResult};

/// A single key-encryption-key descriptor. Exactly one per DEK share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KekInfo {
    /// base64(SHA-256(DER SubjectPublicKeyInfo)) of a locally held RSA key.
    RsaFingerprint(String),
    /// Cloud KMS key URI (`gcp-kms://...`).
    KekUri(String),
}

/// DEK splitting algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySplit {
    /// The single share is the DEK itself.
    None,
    /// Shamir's secret sharing: `shares` total, any `threshold` recover.
    Shamir { shares: u8, threshold: u8 },
}

/// An ordered KEK list plus the splitting algorithm binding shares to KEKs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    pub kek_infos: Vec<KekInfo>,
    pub split: KeySplit,
}

impl KeyConfig {
    /// Enforces the structural invariants: no-split needs exactly one KEK,
    /// Shamir needs 2 <= threshold <= shares == len(kek_infos).
    pub fn validate(&self) -> StetResult<()> {
        match self.split {
            KeySplit::None => {
                if self.kek_infos.len() != 1 {
                    return Err(StetError::ConfigInvalid(format!(
                        "no-split requires exactly 1 KEK, found {}",
                        self.kek_infos.len()
                    )));
                }
            }
            KeySplit::Shamir { shares, threshold } => {
                if threshold < 2 {
                    return Err(StetError::ConfigInvalid(
                        "Shamir threshold must be at least 2".into(),
                    ));
                }
                if threshold > shares {
                    return Err(StetError::ConfigInvalid(format!(
                        "Shamir threshold {threshold} exceeds share count {shares}"
                    )));
                }
                if self.kek_infos.len() != shares as usize {
                    return Err(StetError::ConfigInvalid(format!(
                        "Shamir requires one KEK per share: {} KEKs for {shares} shares",
                        self.kek_infos.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of shares that must be recovered to reconstruct the DEK.
    pub fn threshold(&self) -> usize {
        match self.split {
            KeySplit::None => 1,
            KeySplit::Shamir { threshold, .. } => threshold as usize,
        }
    }

    /// Number of shares the DEK is split into.
    pub fn share_count(&self) -> usize {
        match self.split {
            KeySplit::None => 1,
            KeySplit::Shamir { shares, .. } => shares as usize,
        }
    }
}

/// Configuration for a single Encrypt call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptConfig {
    pub key_config: KeyConfig,
}

/// Configuration for Decrypt: every key config this client may encounter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptConfig {
    pub key_configs: Vec<KeyConfig>,
}

/// Paths to PEM files holding the user's local RSA keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AsymmetricKeys {
    pub public_key_files: Vec<PathBuf>,
    pub private_key_files: Vec<PathBuf>,
}

/// TLS options for the inner secure-session handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EkmTlsOptions {
    /// Skip server certificate verification (bootstrap only).
    pub insecure_skip_verify: bool,
    /// Verify against this CA bundle instead of the system trust store.
    pub ca_cert_path: Option<PathBuf>,
}
