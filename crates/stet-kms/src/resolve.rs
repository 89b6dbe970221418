//! KEK metadata resolution: one `GetCryptoKey` per URI per orchestrator
//! call, cached, with state and protection-level checks.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use stet_core::proto::kms::v1 as kmspb;
use stet_core::proto::kms::v1::crypto_key_version::{ProtectionLevel, State};
use stet_core::uri::kms_resource_name;
use stet_core::{StetError, StetResult};

use crate::client::CloudKms;

/// Protection level of a KEK's primary version, with the external key URI
/// attached where one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KekProtection {
    Software,
    Hsm,
    External { external_key_uri: String },
}

/// Resolved facts about one KEK URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KekMetadata {
    pub protection: KekProtection,
    /// URI reported for observability: the KMS URI for SOFTWARE/HSM, the
    /// external key URI for EXTERNAL.
    pub observable_uri: String,
    /// KMS resource name (URI without the scheme prefix).
    pub resource_name: String,
}

/// Per-call resolver. Owns a metadata cache so each KEK URI is queried at
/// most once within one Encrypt or Decrypt.
pub struct KekResolver<'a> {
    kms: &'a dyn CloudKms,
    cache: HashMap<String, KekMetadata>,
}

impl<'a> KekResolver<'a> {
    pub fn new(kms: &'a dyn CloudKms) -> Self {
        Self {
            kms,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve(
        &mut self,
        kek_uri: &str,
        cancel: &CancellationToken,
    ) -> StetResult<KekMetadata> {
        if let Some(metadata) = self.cache.get(kek_uri) {
            return Ok(metadata.clone());
        }

        let resource_name = kms_resource_name(kek_uri)?.to_string();
        let request = kmspb::GetCryptoKeyRequest {
            name: resource_name.clone(),
        };
        let key = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StetError::Cancelled),
            result = self.kms.get_crypto_key(request) => result?,
        };

        let Some(primary) = key.primary else {
            return Err(StetError::KekDisabled(kek_uri.to_string()));
        };
        if primary.state() != State::Enabled {
            return Err(StetError::KekDisabled(kek_uri.to_string()));
        }

        let protection = match primary.protection_level() {
            ProtectionLevel::Software => KekProtection::Software,
            ProtectionLevel::Hsm => KekProtection::Hsm,
            ProtectionLevel::External => {
                let external_key_uri = primary
                    .external_protection_level_options
                    .as_ref()
                    .map(|options| options.external_key_uri.clone())
                    .filter(|uri| !uri.is_empty())
                    .ok_or_else(|| {
                        StetError::KekUnsupportedProtection(format!(
                            "{kek_uri} is EXTERNAL but has no external key URI"
                        ))
                    })?;
                KekProtection::External { external_key_uri }
            }
            ProtectionLevel::Unspecified => {
                return Err(StetError::KekUnsupportedProtection(kek_uri.to_string()));
            }
        };

        let observable_uri = match &protection {
            KekProtection::External { external_key_uri } => external_key_uri.clone(),
            _ => kek_uri.to_string(),
        };

        let metadata = KekMetadata {
            protection,
            observable_uri,
            resource_name,
        };
        debug!(kek_uri, ?metadata.protection, "resolved KEK metadata");
        self.cache.insert(kek_uri.to_string(), metadata.clone());
        Ok(metadata)
    }
}
