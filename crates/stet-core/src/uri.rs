//! KEK URI handling: the `gcp-kms://` scheme and external key manager URIs.

use url::Url;

use crate::error::{StetError, StetResult};

/// URI prefix identifying a cloud KMS key.
pub const GCP_KMS_PREFIX: &str = "gcp-kms://";

/// Strips the `gcp-kms://` prefix, yielding the KMS resource name.
pub fn kms_resource_name(uri: &str) -> StetResult<&str> {
    uri.strip_prefix(GCP_KMS_PREFIX).ok_or_else(|| {
        StetError::ConfigInvalid(format!("{uri} does not begin with {GCP_KMS_PREFIX}"))
    })
}

/// Connection coordinates derived from an external key URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EkmEndpoint {
    /// RPC endpoint: `<scheme>://<host>[:port]`.
    pub endpoint: String,
    /// Bearer token audience: `<scheme>://<host>`.
    pub audience: String,
    /// Host name, used as the inner-TLS server name.
    pub host: String,
    /// Final path segment, identifying the key on the manager.
    pub key_path: String,
}

/// Splits an external key URI into its RPC endpoint, token audience, and
/// key path.
pub fn parse_ekm_uri(uri: &str) -> StetResult<EkmEndpoint> {
    let parsed = Url::parse(uri)
        .map_err(|e| StetError::SessionInit(format!("invalid external key URI {uri}: {e}")))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| StetError::SessionInit(format!("external key URI {uri} has no host")))?;

    let endpoint = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    };
    let audience = format!("{}://{}", parsed.scheme(), host);

    let key_path = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| {
            StetError::SessionInit(format!("external key URI {uri} has no key path"))
        })?
        .to_string();

    Ok(EkmEndpoint {
        endpoint,
        audience,
        host: host.to_string(),
        key_path,
    })
}
