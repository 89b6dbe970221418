use thiserror::Error;

pub type StetResult<T> = Result<T, StetError>;

/// Error surface of the whole tool. Per-share failures on decrypt are
/// collected rather than propagated; everything else fails the operation.
#[derive(Debug, Error)]
pub enum StetError {
    #[error("invalid key configuration: {0}")]
    ConfigInvalid(String),

    #[error("no matching RSA key for fingerprint {0}")]
    NoMatchingRsaKey(String),

    #[error("KMS unavailable: {0}")]
    KmsUnavailable(String),

    #[error("KMS integrity check failed: {0}")]
    KmsIntegrity(String),

    #[error("KEK {0} is not enabled")]
    KekDisabled(String),

    #[error("unsupported protection level for KEK {0}")]
    KekUnsupportedProtection(String),

    #[error("secure session init failed: {0}")]
    SessionInit(String),

    #[error("inner TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("secure session finalize failed: {0}")]
    Finalize(String),

    #[error("bearer token issuance failed: {0}")]
    TokenIssuance(String),

    #[error("confidential wrap failed: {0}")]
    ConfidentialWrapFailed(String),

    #[error("confidential unwrap failed: {0}")]
    ConfidentialUnwrapFailed(String),

    #[error("secure session is {state}, operation requires {required}")]
    SessionState {
        state: &'static str,
        required: &'static str,
    },

    #[error("unwrapped share {0} does not match its stored hash")]
    ShareHashMismatch(usize),

    #[error("{got} share(s) present, at least {need} required")]
    InsufficientShares { got: usize, need: usize },

    #[error("duplicate share x-coordinate {0}")]
    DuplicateShare(u8),

    #[error("share lengths disagree")]
    LengthMismatch,

    #[error("malformed share")]
    MalformedShare,

    #[error("bad container magic")]
    BadMagic,

    #[error("unsupported container version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("metadata length {0} exceeds the 16 MiB limit")]
    MetadataTooLarge(u64),

    #[error("metadata parse error: {0}")]
    MetadataParse(String),

    #[error("no configured key config matches the blob metadata")]
    NoMatchingKeyConfig,

    #[error("recovered {recovered} of {needed} required shares; share failures: [{}]", .failures.join("; "))]
    BelowThreshold {
        needed: usize,
        recovered: usize,
        failures: Vec<String>,
    },

    #[error("authenticated decryption failed: {0}")]
    AeadFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
