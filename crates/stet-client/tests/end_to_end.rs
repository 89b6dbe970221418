//! End-to-end encrypt/decrypt scenarios over fake KMS and EKM backends.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use tokio_util::sync::CancellationToken;

use stet_client::{keys, EkmSession, EkmSessionFactory, StetClient};
use stet_core::config::{
    AsymmetricKeys, DecryptConfig, EncryptConfig, KekInfo, KeyConfig, KeySplit,
};
use stet_core::{StetError, StetResult};
use stet_kms::testing::FakeKms;
use stet_kms::CloudKms;

const KEY_RING: &str = "projects/p/locations/l/keyRings/r/cryptoKeys";

fn kms_uri(name: &str) -> String {
    format!("gcp-kms://{KEY_RING}/{name}")
}

fn resource(name: &str) -> String {
    format!("{KEY_RING}/{name}")
}

// ── Fake EKM ─────────────────────────────────────────────────────────────────

/// Session-factory fake: wraps with an involutive transform, tracks session
/// teardown, and can inject failures.
struct FakeEkm {
    corrupt_wraps: AtomicBool,
    fail_unwrap: AtomicBool,
    sessions_ended: AtomicUsize,
}

impl FakeEkm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            corrupt_wraps: AtomicBool::new(false),
            fail_unwrap: AtomicBool::new(false),
            sessions_ended: AtomicUsize::new(0),
        })
    }
}

struct FakeEkmSession {
    factory: Arc<FakeEkm>,
}

fn ekm_transform(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ 0x77).collect()
}

#[async_trait]
impl EkmSession for FakeEkmSession {
    async fn confidential_wrap(
        &mut self,
        _key_path: &str,
        _resource_name: &str,
        plaintext: &[u8],
        _cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        let mut wrapped = ekm_transform(plaintext);
        if self.factory.corrupt_wraps.load(Ordering::SeqCst) {
            wrapped[0] ^= 0x01;
        }
        Ok(wrapped)
    }

    async fn confidential_unwrap(
        &mut self,
        _key_path: &str,
        _resource_name: &str,
        wrapped: &[u8],
        _cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        if self.factory.fail_unwrap.load(Ordering::SeqCst) {
            return Err(StetError::ConfidentialUnwrapFailed("injected".into()));
        }
        Ok(ekm_transform(wrapped))
    }

    async fn end_session(&mut self) {
        self.factory.sessions_ended.fetch_add(1, Ordering::SeqCst);
    }
}

struct SharedFakeEkm(Arc<FakeEkm>);

#[async_trait]
impl EkmSessionFactory for SharedFakeEkm {
    async fn open_session(
        &self,
        _external_key_uri: &str,
        _cancel: &CancellationToken,
    ) -> StetResult<Box<dyn EkmSession>> {
        Ok(Box::new(FakeEkmSession {
            factory: self.0.clone(),
        }))
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn client(kms: &Arc<FakeKms>, ekm: &Arc<FakeEkm>) -> StetClient {
    StetClient::new(
        kms.clone() as Arc<dyn CloudKms>,
        Arc::new(SharedFakeEkm(ekm.clone())),
    )
}

struct RsaFixture {
    fingerprint: String,
    keys: AsymmetricKeys,
}

fn rsa_fixture(dir: &std::path::Path, name: &str) -> RsaFixture {
    let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let public_pem = key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();
    let private_pem = key.to_pkcs1_pem(LineEnding::LF).unwrap();

    let public_path = dir.join(format!("{name}.pub.pem"));
    let private_path = dir.join(format!("{name}.pem"));
    std::fs::write(&public_path, public_pem).unwrap();
    std::fs::write(&private_path, private_pem.as_str()).unwrap();

    RsaFixture {
        fingerprint: keys::fingerprint(&key.to_public_key()).unwrap(),
        keys: AsymmetricKeys {
            public_key_files: vec![public_path],
            private_key_files: vec![private_path],
        },
    }
}

fn merge_keys(fixtures: &[&RsaFixture]) -> AsymmetricKeys {
    let mut merged = AsymmetricKeys::default();
    for fixture in fixtures {
        merged
            .public_key_files
            .extend(fixture.keys.public_key_files.clone());
        merged
            .private_key_files
            .extend(fixture.keys.private_key_files.clone());
    }
    merged
}

async fn encrypt_to_vec(
    client: &StetClient,
    plaintext: &[u8],
    config: &EncryptConfig,
    asymmetric_keys: &AsymmetricKeys,
    blob_id: Option<String>,
) -> StetResult<(Vec<u8>, stet_client::EncryptResult)> {
    let mut blob = Vec::new();
    let result = client
        .encrypt(
            &mut Cursor::new(plaintext),
            &mut blob,
            config,
            asymmetric_keys,
            blob_id,
            &CancellationToken::new(),
        )
        .await?;
    Ok((blob, result))
}

async fn decrypt_to_vec(
    client: &StetClient,
    blob: &[u8],
    config: &DecryptConfig,
    asymmetric_keys: &AsymmetricKeys,
) -> (Vec<u8>, StetResult<stet_client::DecryptResult>) {
    let mut plaintext = Vec::new();
    let result = client
        .decrypt(
            &mut Cursor::new(blob),
            &mut plaintext,
            config,
            asymmetric_keys,
            &CancellationToken::new(),
        )
        .await;
    (plaintext, result)
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_split_software_kek_roundtrip() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };

    let (blob, encrypt_result) = encrypt_to_vec(&client, b"hello", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();

    // Container always opens with magic and version.
    assert_eq!(&blob[..5], &[0x53, 0x54, 0x45, 0x54, 0x01]);
    assert_eq!(encrypt_result.key_uris_used, vec![kms_uri("k1")]);
    assert!(!encrypt_result.blob_id.is_empty());

    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (plaintext, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    let decrypt_result = result.unwrap();

    assert_eq!(plaintext, b"hello");
    assert_eq!(decrypt_result.key_uris_used, vec![kms_uri("k1")]);
    assert_eq!(decrypt_result.blob_id, encrypt_result.blob_id);
}

#[tokio::test]
async fn test_caller_blob_id_is_bound() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };

    let (blob, encrypt_result) = encrypt_to_vec(
        &client,
        b"data",
        &config,
        &AsymmetricKeys::default(),
        Some("blob-42".into()),
    )
    .await
    .unwrap();
    assert_eq!(encrypt_result.blob_id, "blob-42");

    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (_, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    assert_eq!(result.unwrap().blob_id, "blob-42");
}

fn mixed_key_config(rsa_a: &RsaFixture, rsa_b: &RsaFixture) -> KeyConfig {
    KeyConfig {
        kek_infos: vec![
            KekInfo::RsaFingerprint(rsa_a.fingerprint.clone()),
            KekInfo::KekUri(kms_uri("hsm")),
            KekInfo::KekUri(kms_uri("ext")),
            KekInfo::RsaFingerprint(rsa_b.fingerprint.clone()),
            KekInfo::KekUri(kms_uri("soft")),
        ],
        split: KeySplit::Shamir {
            shares: 5,
            threshold: 3,
        },
    }
}

const EXT_URI: &str = "https://ekm.example.com:8443/v0/keys/key-e";

fn mixed_kms() -> Arc<FakeKms> {
    let kms = Arc::new(FakeKms::new());
    kms.add_hsm_key(&resource("hsm"));
    kms.add_external_key(&resource("ext"), EXT_URI);
    kms.add_software_key(&resource("soft"));
    kms
}

#[tokio::test]
async fn test_shamir_mixed_keks_tolerates_missing_rsa_keys() {
    let dir = tempfile::tempdir().unwrap();
    let rsa_a = rsa_fixture(dir.path(), "a");
    let rsa_b = rsa_fixture(dir.path(), "b");
    let kms = mixed_kms();
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: mixed_key_config(&rsa_a, &rsa_b),
    };
    let all_keys = merge_keys(&[&rsa_a, &rsa_b]);
    let plaintext = b"split across five trust domains";

    let (blob, encrypt_result) = encrypt_to_vec(&client, plaintext, &config, &all_keys, None)
        .await
        .unwrap();
    assert_eq!(
        encrypt_result.key_uris_used,
        vec![kms_uri("hsm"), EXT_URI.to_string(), kms_uri("soft")]
    );

    // Both RSA private keys are gone: shares 0 and 3 cannot be unwrapped,
    // but HSM + EXTERNAL + SOFTWARE still meet the 3-of-5 threshold.
    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (recovered, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    let decrypt_result = result.unwrap();

    assert_eq!(recovered, plaintext);
    assert_eq!(
        decrypt_result.key_uris_used,
        vec![kms_uri("hsm"), EXT_URI.to_string(), kms_uri("soft")]
    );
    // Every EXTERNAL operation tears its session down.
    assert!(ekm.sessions_ended.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_shamir_below_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let rsa_a = rsa_fixture(dir.path(), "a");
    let rsa_b = rsa_fixture(dir.path(), "b");
    let kms = mixed_kms();
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: mixed_key_config(&rsa_a, &rsa_b),
    };
    let all_keys = merge_keys(&[&rsa_a, &rsa_b]);

    let (blob, _) = encrypt_to_vec(&client, b"secret", &config, &all_keys, None)
        .await
        .unwrap();

    // Drop both RSA keys and the HSM KEK: only EXTERNAL + SOFTWARE remain,
    // one short of the threshold.
    kms.remove_key(&resource("hsm"));
    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (plaintext, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;

    match result {
        Err(StetError::BelowThreshold {
            needed,
            recovered,
            failures,
        }) => {
            assert_eq!(needed, 3);
            assert_eq!(recovered, 2);
            assert_eq!(failures.len(), 3);
        }
        other => panic!("expected BelowThreshold, got {other:?}"),
    }
    assert!(plaintext.is_empty(), "no plaintext may be released");
}

#[tokio::test]
async fn test_corrupted_wrap_is_caught_by_share_hash() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("s1"));
    kms.add_external_key(&resource("ext"), EXT_URI);
    kms.add_software_key(&resource("s2"));
    let ekm = FakeEkm::new();
    ekm.corrupt_wraps.store(true, Ordering::SeqCst);
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![
                KekInfo::KekUri(kms_uri("s1")),
                KekInfo::KekUri(kms_uri("ext")),
                KekInfo::KekUri(kms_uri("s2")),
            ],
            split: KeySplit::Shamir {
                shares: 3,
                threshold: 2,
            },
        },
    };

    let (blob, _) = encrypt_to_vec(&client, b"payload", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();

    // The EXTERNAL share was corrupted at wrap time (inside the sealed
    // metadata, so the AAD is consistent). Its hash check fails on decrypt
    // and the two software shares carry the threshold.
    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (plaintext, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    let decrypt_result = result.unwrap();

    assert_eq!(plaintext, b"payload");
    assert_eq!(
        decrypt_result.key_uris_used,
        vec![kms_uri("s1"), kms_uri("s2")]
    );
}

#[tokio::test]
async fn test_external_unwrap_failure_counts_against_threshold() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("s1"));
    kms.add_external_key(&resource("ext"), EXT_URI);
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![
                KekInfo::KekUri(kms_uri("s1")),
                KekInfo::KekUri(kms_uri("ext")),
            ],
            split: KeySplit::Shamir {
                shares: 2,
                threshold: 2,
            },
        },
    };
    let (blob, _) = encrypt_to_vec(&client, b"payload", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();

    ekm.fail_unwrap.store(true, Ordering::SeqCst);
    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (_, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;

    match result {
        Err(StetError::BelowThreshold {
            needed, recovered, ..
        }) => {
            assert_eq!(needed, 2);
            assert_eq!(recovered, 1);
        }
        other => panic!("expected BelowThreshold, got {other:?}"),
    }
    // The failed unwrap still tore its session down.
    assert!(ekm.sessions_ended.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_metadata_bit_flip_fails_aead() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let (mut blob, _) = encrypt_to_vec(&client, b"payload", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();

    // Offset 12 is the first metadata byte; 12 + 5 lands inside the
    // blob_id value. Low-bit flips keep it printable ASCII.
    blob[12 + 5] ^= 0x01;

    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (plaintext, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;

    assert!(matches!(result, Err(StetError::AeadFailed(_))));
    assert!(plaintext.is_empty());
}

#[tokio::test]
async fn test_ciphertext_bit_flip_fails_aead() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let (mut blob, _) = encrypt_to_vec(&client, b"payload", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0x80;

    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (plaintext, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;

    assert!(matches!(result, Err(StetError::AeadFailed(_))));
    assert!(plaintext.is_empty());
}

#[tokio::test]
async fn test_kms_transport_corruption_fails_encrypt() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    kms.set_corrupt_response_crc(true);
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let mut blob = Vec::new();
    let result = client
        .encrypt(
            &mut Cursor::new(b"payload".as_slice()),
            &mut blob,
            &config,
            &AsymmetricKeys::default(),
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(StetError::KmsIntegrity(_))));
    assert!(blob.is_empty(), "no header may be written after a wrap failure");
}

#[tokio::test]
async fn test_cancelled_encrypt_aborts() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut blob = Vec::new();
    let result = client
        .encrypt(
            &mut Cursor::new(b"payload".as_slice()),
            &mut blob,
            &config,
            &AsymmetricKeys::default(),
            None,
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(StetError::Cancelled)));
    assert!(blob.is_empty());
}

#[tokio::test]
async fn test_no_matching_key_config() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    kms.add_software_key(&resource("other"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let (blob, _) = encrypt_to_vec(&client, b"payload", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();

    let decrypt_config = DecryptConfig {
        key_configs: vec![KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("other"))],
            split: KeySplit::None,
        }],
    };
    let (_, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    assert!(matches!(result, Err(StetError::NoMatchingKeyConfig)));
}

#[tokio::test]
async fn test_invalid_encrypt_config_rejected() {
    let kms = Arc::new(FakeKms::new());
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![
                KekInfo::KekUri(kms_uri("a")),
                KekInfo::KekUri(kms_uri("b")),
            ],
            split: KeySplit::None,
        },
    };
    let mut blob = Vec::new();
    let result = client
        .encrypt(
            &mut Cursor::new(b"x".as_slice()),
            &mut blob,
            &config,
            &AsymmetricKeys::default(),
            None,
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(StetError::ConfigInvalid(_))));
}

#[tokio::test]
async fn test_empty_plaintext_roundtrip() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let (blob, _) = encrypt_to_vec(&client, b"", &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();

    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (plaintext, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    result.unwrap();
    assert!(plaintext.is_empty());
}

#[tokio::test]
async fn test_multi_chunk_roundtrip() {
    let kms = Arc::new(FakeKms::new());
    kms.add_software_key(&resource("k1"));
    let ekm = FakeEkm::new();
    let client = client(&kms, &ekm);

    let config = EncryptConfig {
        key_config: KeyConfig {
            kek_infos: vec![KekInfo::KekUri(kms_uri("k1"))],
            split: KeySplit::None,
        },
    };
    let plaintext: Vec<u8> = (0..(2 * 1024 * 1024 + 123_456)).map(|i| (i % 251) as u8).collect();

    let (blob, _) = encrypt_to_vec(&client, &plaintext, &config, &AsymmetricKeys::default(), None)
        .await
        .unwrap();
    assert!(blob.len() > plaintext.len());

    let decrypt_config = DecryptConfig {
        key_configs: vec![config.key_config.clone()],
    };
    let (recovered, result) =
        decrypt_to_vec(&client, &blob, &decrypt_config, &AsymmetricKeys::default()).await;
    result.unwrap();
    assert_eq!(recovered, plaintext);
}
