//! In-memory fake KMS, mirroring the behavior the client depends on:
//! CRC32C verification on requests, CRC32C declaration on responses, and
//! key metadata lookup. Failure injection knobs cover the integrity paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use stet_core::proto::kms::v1 as kmspb;
use stet_core::proto::kms::v1::crypto_key_version::{ProtectionLevel, State};
use stet_core::{StetError, StetResult};

use crate::client::CloudKms;

#[derive(Clone)]
struct FakeKey {
    state: State,
    protection_level: ProtectionLevel,
    external_key_uri: Option<String>,
}

/// Scriptable fake of the KMS surface.
pub struct FakeKms {
    keys: Mutex<HashMap<String, FakeKey>>,
    skip_request_crc_verification: AtomicBool,
    corrupt_response_crc: AtomicBool,
    get_crypto_key_calls: AtomicUsize,
}

impl FakeKms {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            skip_request_crc_verification: AtomicBool::new(false),
            corrupt_response_crc: AtomicBool::new(false),
            get_crypto_key_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_software_key(&self, name: &str) {
        self.add_key(name, State::Enabled, ProtectionLevel::Software, None);
    }

    pub fn add_hsm_key(&self, name: &str) {
        self.add_key(name, State::Enabled, ProtectionLevel::Hsm, None);
    }

    pub fn add_external_key(&self, name: &str, external_key_uri: &str) {
        self.add_key(
            name,
            State::Enabled,
            ProtectionLevel::External,
            Some(external_key_uri.to_string()),
        );
    }

    pub fn add_disabled_key(&self, name: &str) {
        self.add_key(name, State::Disabled, ProtectionLevel::Software, None);
    }

    pub fn add_unspecified_key(&self, name: &str) {
        self.add_key(name, State::Enabled, ProtectionLevel::Unspecified, None);
    }

    fn add_key(
        &self,
        name: &str,
        state: State,
        protection_level: ProtectionLevel,
        external_key_uri: Option<String>,
    ) {
        self.keys.lock().unwrap().insert(
            name.to_string(),
            FakeKey {
                state,
                protection_level,
                external_key_uri,
            },
        );
    }

    /// Simulate a key becoming unreachable after it was used.
    pub fn remove_key(&self, name: &str) {
        self.keys.lock().unwrap().remove(name);
    }

    /// Pretend the server never verified the request CRC.
    pub fn set_skip_request_crc_verification(&self, value: bool) {
        self.skip_request_crc_verification
            .store(value, Ordering::SeqCst);
    }

    /// Declare a CRC that disagrees with the returned payload.
    pub fn set_corrupt_response_crc(&self, value: bool) {
        self.corrupt_response_crc.store(value, Ordering::SeqCst);
    }

    pub fn get_crypto_key_calls(&self) -> usize {
        self.get_crypto_key_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, name: &str) -> StetResult<FakeKey> {
        self.keys
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StetError::KmsUnavailable(format!("key not found: {name}")))
    }

    fn response_crc(&self, payload: &[u8]) -> i64 {
        let crc = crc32c::crc32c(payload) as i64;
        if self.corrupt_response_crc.load(Ordering::SeqCst) {
            crc ^ 1
        } else {
            crc
        }
    }
}

impl Default for FakeKms {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic, invertible keystream transform standing in for real KMS
/// encryption. Keyed by the resource name only, so wrap followed by unwrap
/// under the same key is the identity.
fn keystream_xor(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut block_index = 0u64;
    while out.len() < data.len() {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(block_index.to_le_bytes());
        let block = hasher.finalize();
        for &b in block.iter() {
            if out.len() == data.len() {
                break;
            }
            out.push(data[out.len()] ^ b);
        }
        block_index += 1;
    }
    out
}

#[async_trait]
impl CloudKms for FakeKms {
    async fn get_crypto_key(
        &self,
        request: kmspb::GetCryptoKeyRequest,
    ) -> StetResult<kmspb::CryptoKey> {
        self.get_crypto_key_calls.fetch_add(1, Ordering::SeqCst);
        let key = self.lookup(&request.name)?;
        Ok(kmspb::CryptoKey {
            name: request.name.clone(),
            primary: Some(kmspb::CryptoKeyVersion {
                name: format!("{}/cryptoKeyVersions/1", request.name),
                state: key.state as i32,
                protection_level: key.protection_level as i32,
                external_protection_level_options: key.external_key_uri.map(|uri| {
                    kmspb::ExternalProtectionLevelOptions {
                        external_key_uri: uri,
                    }
                }),
            }),
        })
    }

    async fn encrypt(&self, request: kmspb::EncryptRequest) -> StetResult<kmspb::EncryptResponse> {
        self.lookup(&request.name)?;
        let verified = !self.skip_request_crc_verification.load(Ordering::SeqCst)
            && crc32c::crc32c(&request.plaintext) as i64 == request.plaintext_crc32c;

        let ciphertext = keystream_xor(&request.name, &request.plaintext);
        let ciphertext_crc32c = self.response_crc(&ciphertext);
        Ok(kmspb::EncryptResponse {
            ciphertext,
            ciphertext_crc32c,
            verified_plaintext_crc32c: verified,
        })
    }

    async fn decrypt(&self, request: kmspb::DecryptRequest) -> StetResult<kmspb::DecryptResponse> {
        self.lookup(&request.name)?;
        let plaintext = keystream_xor(&request.name, &request.ciphertext);
        let plaintext_crc32c = self.response_crc(&plaintext);
        Ok(kmspb::DecryptResponse {
            plaintext,
            plaintext_crc32c,
        })
    }
}
