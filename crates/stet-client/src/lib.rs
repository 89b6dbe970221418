//! stet-client: the Encrypt/Decrypt orchestrator.
//!
//! Encrypt: generate DEK → split per the key config → wrap every share
//! under its KEK (local RSA, cloud KMS, or a secure session to an external
//! key manager) → seal metadata into the container → stream AEAD.
//!
//! Decrypt reverses the pipeline and tolerates per-share failures as long
//! as the configured threshold can still be met.

pub mod keys;

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use stet_core::config::{
    AsymmetricKeys, DecryptConfig, EkmTlsOptions, EncryptConfig, KekInfo, KeySplit,
};
use stet_core::uri::parse_ekm_uri;
use stet_core::{StetError, StetResult};
use stet_crypto::{aead, container, shares, Dek, Metadata, Share, WrappedShare};
use stet_ekm::{build_client_config, EkmGrpcTransport, SecureSession, TokenProvider};
use stet_kms::{CloudKms, KekProtection, KekResolver};

/// Outcome of a successful encrypt.
#[derive(Debug)]
pub struct EncryptResult {
    /// Observable URIs of the KEKs that wrapped shares, in share order.
    pub key_uris_used: Vec<String>,
    pub blob_id: String,
}

/// Outcome of a successful decrypt.
#[derive(Debug)]
pub struct DecryptResult {
    /// Observable URIs of the shares actually consumed in reconstruction.
    pub key_uris_used: Vec<String>,
    pub blob_id: String,
}

/// One single-use confidential session against an external key manager.
#[async_trait]
pub trait EkmSession: Send {
    async fn confidential_wrap(
        &mut self,
        key_path: &str,
        resource_name: &str,
        plaintext: &[u8],
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>>;

    async fn confidential_unwrap(
        &mut self,
        key_path: &str,
        resource_name: &str,
        wrapped: &[u8],
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>>;

    async fn end_session(&mut self);
}

#[async_trait]
impl EkmSession for SecureSession {
    async fn confidential_wrap(
        &mut self,
        key_path: &str,
        resource_name: &str,
        plaintext: &[u8],
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        self.wrap(key_path, resource_name, plaintext, cancel).await
    }

    async fn confidential_unwrap(
        &mut self,
        key_path: &str,
        resource_name: &str,
        wrapped: &[u8],
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        self.unwrap(key_path, resource_name, wrapped, cancel).await
    }

    async fn end_session(&mut self) {
        self.end().await;
    }
}

/// Opens secure sessions. One session per wrap or unwrap.
#[async_trait]
pub trait EkmSessionFactory: Send + Sync {
    async fn open_session(
        &self,
        external_key_uri: &str,
        cancel: &CancellationToken,
    ) -> StetResult<Box<dyn EkmSession>>;
}

/// Production factory: bearer token for the key URI's audience, gRPC
/// transport, inner-TLS establishment.
pub struct SecureSessionFactory {
    token_provider: Arc<dyn TokenProvider>,
    tls_options: EkmTlsOptions,
}

impl SecureSessionFactory {
    pub fn new(token_provider: Arc<dyn TokenProvider>, tls_options: EkmTlsOptions) -> Self {
        Self {
            token_provider,
            tls_options,
        }
    }
}

#[async_trait]
impl EkmSessionFactory for SecureSessionFactory {
    async fn open_session(
        &self,
        external_key_uri: &str,
        cancel: &CancellationToken,
    ) -> StetResult<Box<dyn EkmSession>> {
        let endpoint = parse_ekm_uri(external_key_uri)?;
        let token = self.token_provider.bearer_token(&endpoint.audience).await?;
        let transport = EkmGrpcTransport::connect(&endpoint.endpoint, &token).await?;
        let tls_config = build_client_config(&self.tls_options)?;
        let session = SecureSession::establish(
            Box::new(transport),
            tls_config,
            &endpoint.host,
            None,
            cancel,
        )
        .await?;
        Ok(Box::new(session))
    }
}

/// The Split-Trust Encryption Tool client.
pub struct StetClient {
    kms: Arc<dyn CloudKms>,
    ekm: Arc<dyn EkmSessionFactory>,
}

impl StetClient {
    pub fn new(kms: Arc<dyn CloudKms>, ekm: Arc<dyn EkmSessionFactory>) -> Self {
        Self { kms, ekm }
    }

    /// Encrypts `reader` into `writer` as a STET container.
    ///
    /// Any wrap failure aborts before a single output byte is written, so
    /// the output is either empty or a complete valid blob.
    pub async fn encrypt<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        config: &EncryptConfig,
        asymmetric_keys: &AsymmetricKeys,
        blob_id: Option<String>,
        cancel: &CancellationToken,
    ) -> StetResult<EncryptResult> {
        let key_config = &config.key_config;
        key_config.validate()?;

        let dek = Dek::generate();
        let dek_shares: Vec<Share> = match key_config.split {
            KeySplit::None => vec![Share::new(dek.as_bytes().to_vec())],
            KeySplit::Shamir { shares, threshold } => shares::split(&dek, shares, threshold)?,
        };
        let blob_id = blob_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut resolver = KekResolver::new(self.kms.as_ref());
        let mut wrapped_shares = Vec::with_capacity(dek_shares.len());
        let mut key_uris_used = Vec::new();

        for (share, kek) in dek_shares.iter().zip(&key_config.kek_infos) {
            let hash = shares::hash_share(share.as_bytes());
            let wrapped = self
                .wrap_one(
                    share.as_bytes(),
                    kek,
                    asymmetric_keys,
                    &mut resolver,
                    &mut key_uris_used,
                    cancel,
                )
                .await?;
            wrapped_shares.push(WrappedShare {
                share: wrapped,
                hash: hash.to_vec(),
            });
        }

        let metadata = Metadata {
            blob_id: blob_id.clone(),
            key_config: key_config.clone(),
            shares: wrapped_shares,
        };
        let metadata_bytes = container::encode_metadata(&metadata);

        container::write_blob_header(writer, &metadata_bytes)?;
        let plaintext_bytes = aead::seal_stream(&dek, &metadata_bytes, reader, writer)?;

        info!(
            blob_id = %blob_id,
            shares = metadata.shares.len(),
            plaintext_bytes,
            "encrypt complete"
        );
        Ok(EncryptResult {
            key_uris_used,
            blob_id,
        })
    }

    /// Decrypts a STET container from `reader` into `writer`.
    ///
    /// Per-share unwrap failures are recorded and skipped while the
    /// threshold remains reachable; container, AEAD, and combine failures
    /// are fatal.
    pub async fn decrypt<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        config: &DecryptConfig,
        asymmetric_keys: &AsymmetricKeys,
        cancel: &CancellationToken,
    ) -> StetResult<DecryptResult> {
        let metadata_bytes = container::read_blob_header(reader)?;
        let metadata = container::decode_metadata(&metadata_bytes)?;

        let canonical = container::encode_key_config(&metadata.key_config);
        let matching = config
            .key_configs
            .iter()
            .find(|candidate| container::encode_key_config(candidate) == canonical)
            .ok_or(StetError::NoMatchingKeyConfig)?;

        let threshold = matching.threshold();
        let mut resolver = KekResolver::new(self.kms.as_ref());
        let mut recovered: Vec<Share> = Vec::new();
        let mut key_uris_used = Vec::new();
        let mut failures = Vec::new();

        for (index, (wrapped, kek)) in
            metadata.shares.iter().zip(&matching.kek_infos).enumerate()
        {
            // The first `threshold` recovered shares reconstruct the DEK;
            // later shares are never consumed.
            if recovered.len() == threshold {
                break;
            }
            match self
                .unwrap_one(wrapped, kek, asymmetric_keys, &mut resolver, cancel)
                .await
            {
                Ok((share_bytes, uri)) => {
                    if !shares::validate_share(&share_bytes, &wrapped.hash) {
                        let error = StetError::ShareHashMismatch(index);
                        warn!(share = index, %error, "share failed hash validation");
                        failures.push(describe_failure(index, kek, &error));
                        continue;
                    }
                    recovered.push(Share::new(share_bytes));
                    if let Some(uri) = uri {
                        key_uris_used.push(uri);
                    }
                }
                Err(StetError::Cancelled) => return Err(StetError::Cancelled),
                Err(error) => {
                    warn!(share = index, %error, "share unwrap failed");
                    failures.push(describe_failure(index, kek, &error));
                }
            }
        }

        if recovered.len() < threshold {
            return Err(StetError::BelowThreshold {
                needed: threshold,
                recovered: recovered.len(),
                failures,
            });
        }

        let dek = match matching.split {
            KeySplit::None => {
                Dek::from_slice(recovered[0].as_bytes()).ok_or(StetError::MalformedShare)?
            }
            KeySplit::Shamir { .. } => shares::combine(&recovered, threshold)?,
        };

        let plaintext_bytes = aead::open_stream(&dek, &metadata_bytes, reader, writer)?;

        info!(
            blob_id = %metadata.blob_id,
            plaintext_bytes,
            skipped_shares = failures.len(),
            "decrypt complete"
        );
        Ok(DecryptResult {
            key_uris_used,
            blob_id: metadata.blob_id,
        })
    }

    async fn wrap_one(
        &self,
        share: &[u8],
        kek: &KekInfo,
        asymmetric_keys: &AsymmetricKeys,
        resolver: &mut KekResolver<'_>,
        key_uris_used: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        match kek {
            KekInfo::RsaFingerprint(fingerprint) => {
                let public_key = keys::public_key_for_fingerprint(asymmetric_keys, fingerprint)?;
                keys::wrap_share(&public_key, share)
            }
            KekInfo::KekUri(uri) => {
                let kek_metadata = resolver.resolve(uri, cancel).await?;
                let wrapped = match &kek_metadata.protection {
                    KekProtection::Software | KekProtection::Hsm => {
                        stet_kms::wrap_share(
                            self.kms.as_ref(),
                            share,
                            &kek_metadata.resource_name,
                            cancel,
                        )
                        .await?
                    }
                    KekProtection::External { external_key_uri } => {
                        self.ekm_confidential(
                            share,
                            &kek_metadata.resource_name,
                            external_key_uri,
                            Direction::Wrap,
                            cancel,
                        )
                        .await?
                    }
                };
                key_uris_used.push(kek_metadata.observable_uri.clone());
                Ok(wrapped)
            }
        }
    }

    async fn unwrap_one(
        &self,
        wrapped: &WrappedShare,
        kek: &KekInfo,
        asymmetric_keys: &AsymmetricKeys,
        resolver: &mut KekResolver<'_>,
        cancel: &CancellationToken,
    ) -> StetResult<(Vec<u8>, Option<String>)> {
        match kek {
            KekInfo::RsaFingerprint(fingerprint) => {
                let private_key =
                    keys::private_key_for_fingerprint(asymmetric_keys, fingerprint)?;
                let share = keys::unwrap_share(&private_key, &wrapped.share)?;
                Ok((share, None))
            }
            KekInfo::KekUri(uri) => {
                let kek_metadata = resolver.resolve(uri, cancel).await?;
                let share = match &kek_metadata.protection {
                    KekProtection::Software | KekProtection::Hsm => {
                        stet_kms::unwrap_share(
                            self.kms.as_ref(),
                            &wrapped.share,
                            &kek_metadata.resource_name,
                            cancel,
                        )
                        .await?
                    }
                    KekProtection::External { external_key_uri } => {
                        self.ekm_confidential(
                            &wrapped.share,
                            &kek_metadata.resource_name,
                            external_key_uri,
                            Direction::Unwrap,
                            cancel,
                        )
                        .await?
                    }
                };
                Ok((share, Some(kek_metadata.observable_uri.clone())))
            }
        }
    }

    /// One secure session per operation: establish, wrap or unwrap, end.
    async fn ekm_confidential(
        &self,
        payload: &[u8],
        resource_name: &str,
        external_key_uri: &str,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        let endpoint = parse_ekm_uri(external_key_uri)?;
        let mut session = self.ekm.open_session(external_key_uri, cancel).await?;
        let result = match direction {
            Direction::Wrap => {
                session
                    .confidential_wrap(&endpoint.key_path, resource_name, payload, cancel)
                    .await
            }
            Direction::Unwrap => {
                session
                    .confidential_unwrap(&endpoint.key_path, resource_name, payload, cancel)
                    .await
            }
        };
        session.end_session().await;
        result
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Wrap,
    Unwrap,
}

fn describe_failure(index: usize, kek: &KekInfo, error: &StetError) -> String {
    match kek {
        KekInfo::RsaFingerprint(_) => format!("share {index} (rsa): {error}"),
        KekInfo::KekUri(uri) => format!("share {index} ({uri}): {error}"),
    }
}
