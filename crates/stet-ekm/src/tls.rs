//! Inner-TLS client configuration. The suite set is closed: AEAD-only
//! ECDHE suites with AES-GCM or CHACHA20-POLY1305, TLS 1.2 and 1.3.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CipherSuite, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tracing::warn;

use stet_core::config::EkmTlsOptions;
use stet_core::{StetError, StetResult};

const ALLOWED_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

fn restricted_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider
        .cipher_suites
        .retain(|suite| ALLOWED_SUITES.contains(&suite.suite()));
    provider
}

/// Builds the client config for the inner TLS session. By default the
/// server chain is verified against the system trust store; a CA file or
/// (for bootstrap only) `insecure_skip_verify` can override that.
pub fn build_client_config(options: &EkmTlsOptions) -> StetResult<Arc<ClientConfig>> {
    let provider = Arc::new(restricted_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| StetError::SessionInit(format!("TLS protocol setup: {e}")))?;

    let config = if options.insecure_skip_verify {
        warn!("inner TLS server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier {
                schemes: provider.signature_verification_algorithms.supported_schemes(),
            }))
            .with_no_client_auth()
    } else {
        let roots = match &options.ca_cert_path {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                let file = File::open(path).map_err(|e| {
                    StetError::SessionInit(format!("opening CA file {}: {e}", path.display()))
                })?;
                for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                    let cert = cert.map_err(|e| {
                        StetError::SessionInit(format!("parsing CA file {}: {e}", path.display()))
                    })?;
                    roots.add(cert).map_err(|e| {
                        StetError::SessionInit(format!("adding CA certificate: {e}"))
                    })?;
                }
                roots
            }
            None => {
                let mut roots = RootCertStore::empty();
                let native = rustls_native_certs::load_native_certs();
                for error in &native.errors {
                    warn!(%error, "skipping unreadable system root certificate");
                }
                for cert in native.certs {
                    let _ = roots.add(cert);
                }
                roots
            }
        };
        if roots.is_empty() {
            return Err(StetError::SessionInit(
                "no trusted root certificates available".into(),
            ));
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Accepts any server certificate. Installed only when the configuration
/// explicitly opts out of verification.
#[derive(Debug)]
struct InsecureVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
