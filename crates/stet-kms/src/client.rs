//! The KMS RPC surface STET consumes, and share wrap/unwrap on top of it.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use stet_core::proto::kms::v1 as kmspb;
use stet_core::proto::kms::v1::key_management_client::KeyManagementClient;
use stet_core::{StetError, StetResult};

/// Cloud KMS operations. Implemented over gRPC in production and by an
/// in-memory fake in tests.
#[async_trait]
pub trait CloudKms: Send + Sync {
    async fn get_crypto_key(
        &self,
        request: kmspb::GetCryptoKeyRequest,
    ) -> StetResult<kmspb::CryptoKey>;

    async fn encrypt(&self, request: kmspb::EncryptRequest) -> StetResult<kmspb::EncryptResponse>;

    async fn decrypt(&self, request: kmspb::DecryptRequest) -> StetResult<kmspb::DecryptResponse>;
}

/// gRPC-backed KMS client.
pub struct KmsGrpcClient {
    client: KeyManagementClient<Channel>,
}

impl KmsGrpcClient {
    pub async fn connect(endpoint: &str) -> StetResult<Self> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| StetError::KmsUnavailable(format!("bad endpoint {endpoint}: {e}")))?
            .user_agent(stet_core::user_agent())
            .map_err(|e| StetError::KmsUnavailable(format!("user agent: {e}")))?
            .connect()
            .await
            .map_err(|e| StetError::KmsUnavailable(format!("connect {endpoint}: {e}")))?;
        Ok(Self {
            client: KeyManagementClient::new(channel),
        })
    }
}

#[async_trait]
impl CloudKms for KmsGrpcClient {
    async fn get_crypto_key(
        &self,
        request: kmspb::GetCryptoKeyRequest,
    ) -> StetResult<kmspb::CryptoKey> {
        let mut client = self.client.clone();
        let response = client
            .get_crypto_key(request)
            .await
            .map_err(|status| StetError::KmsUnavailable(status.to_string()))?;
        Ok(response.into_inner())
    }

    async fn encrypt(&self, request: kmspb::EncryptRequest) -> StetResult<kmspb::EncryptResponse> {
        let mut client = self.client.clone();
        let response = client
            .encrypt(request)
            .await
            .map_err(|status| StetError::KmsUnavailable(status.to_string()))?;
        Ok(response.into_inner())
    }

    async fn decrypt(&self, request: kmspb::DecryptRequest) -> StetResult<kmspb::DecryptResponse> {
        let mut client = self.client.clone();
        let response = client
            .decrypt(request)
            .await
            .map_err(|status| StetError::KmsUnavailable(status.to_string()))?;
        Ok(response.into_inner())
    }
}

/// Connects on first use, so configurations that never touch a KMS KEK
/// never open a channel.
pub struct LazyKmsClient {
    endpoint: String,
    client: tokio::sync::OnceCell<KmsGrpcClient>,
}

impl LazyKmsClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: tokio::sync::OnceCell::new(),
        }
    }

    async fn get(&self) -> StetResult<&KmsGrpcClient> {
        self.client
            .get_or_try_init(|| KmsGrpcClient::connect(&self.endpoint))
            .await
    }
}

#[async_trait]
impl CloudKms for LazyKmsClient {
    async fn get_crypto_key(
        &self,
        request: kmspb::GetCryptoKeyRequest,
    ) -> StetResult<kmspb::CryptoKey> {
        self.get().await?.get_crypto_key(request).await
    }

    async fn encrypt(&self, request: kmspb::EncryptRequest) -> StetResult<kmspb::EncryptResponse> {
        self.get().await?.encrypt(request).await
    }

    async fn decrypt(&self, request: kmspb::DecryptRequest) -> StetResult<kmspb::DecryptResponse> {
        self.get().await?.decrypt(request).await
    }
}

/// Wrap a share under the named KMS key.
///
/// The request carries a CRC32C of the plaintext; the response must confirm
/// the server verified it, and the returned ciphertext must match its
/// declared CRC32C.
pub async fn wrap_share(
    kms: &dyn CloudKms,
    share: &[u8],
    resource_name: &str,
    cancel: &CancellationToken,
) -> StetResult<Vec<u8>> {
    let request = kmspb::EncryptRequest {
        name: resource_name.to_string(),
        plaintext: share.to_vec(),
        plaintext_crc32c: crc32c::crc32c(share) as i64,
    };

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StetError::Cancelled),
        result = kms.encrypt(request) => result?,
    };

    if !response.verified_plaintext_crc32c {
        return Err(StetError::KmsIntegrity(
            "Encrypt request corrupted in transit".into(),
        ));
    }
    if crc32c::crc32c(&response.ciphertext) as i64 != response.ciphertext_crc32c {
        return Err(StetError::KmsIntegrity(
            "Encrypt response corrupted in transit".into(),
        ));
    }
    Ok(response.ciphertext)
}

/// Unwrap a share under the named KMS key, checking the response CRC32C.
pub async fn unwrap_share(
    kms: &dyn CloudKms,
    wrapped: &[u8],
    resource_name: &str,
    cancel: &CancellationToken,
) -> StetResult<Vec<u8>> {
    let request = kmspb::DecryptRequest {
        name: resource_name.to_string(),
        ciphertext: wrapped.to_vec(),
        ciphertext_crc32c: crc32c::crc32c(wrapped) as i64,
    };

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StetError::Cancelled),
        result = kms.decrypt(request) => result?,
    };

    if crc32c::crc32c(&response.plaintext) as i64 != response.plaintext_crc32c {
        return Err(StetError::KmsIntegrity(
            "Decrypt response corrupted in transit".into(),
        ));
    }
    Ok(response.plaintext)
}
