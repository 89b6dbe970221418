//! The secure session state machine.
//!
//! Client-side states:
//! `Init → AwaitServerHello → Handshaking → Finalising → Open → Closed`.
//! Each transition is driven by one RPC; the inner TLS engine advances by
//! consuming and producing records through the shim. `session_context` is
//! an opaque server token echoed on every call after `BeginSession`.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stet_core::proto::ekm::v1 as ekmpb;
use stet_core::{StetError, StetResult};

use crate::shim::RecordShim;

/// TLS record content type for handshake records.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ServerHello (record payload byte 5).
const HANDSHAKE_TYPE_SERVER_HELLO: u8 = 0x02;

/// The EKM RPC surface. gRPC in production; tests substitute in-process
/// implementations.
#[async_trait]
pub trait EkmTransport: Send + Sync {
    async fn begin_session(
        &self,
        request: ekmpb::BeginSessionRequest,
    ) -> StetResult<ekmpb::BeginSessionResponse>;

    async fn handshake(
        &self,
        request: ekmpb::HandshakeRequest,
    ) -> StetResult<ekmpb::HandshakeResponse>;

    async fn finalize(
        &self,
        request: ekmpb::FinalizeRequest,
    ) -> StetResult<ekmpb::FinalizeResponse>;

    async fn confidential_wrap(
        &self,
        request: ekmpb::ConfidentialWrapRequest,
    ) -> StetResult<ekmpb::ConfidentialWrapResponse>;

    async fn confidential_unwrap(
        &self,
        request: ekmpb::ConfidentialUnwrapRequest,
    ) -> StetResult<ekmpb::ConfidentialUnwrapResponse>;

    async fn end_session(
        &self,
        request: ekmpb::EndSessionRequest,
    ) -> StetResult<ekmpb::EndSessionResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    AwaitServerHello,
    Handshaking,
    Finalising,
    Open,
    Closed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::AwaitServerHello => "await-server-hello",
            SessionState::Handshaking => "handshaking",
            SessionState::Finalising => "finalising",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        }
    }
}

/// One established inner-TLS session. Single-use: one wrap or unwrap, then
/// `end`.
pub struct SecureSession {
    transport: Box<dyn EkmTransport>,
    tls: ClientConnection,
    shim: RecordShim,
    context: Vec<u8>,
    state: SessionState,
}

impl SecureSession {
    /// Runs `BeginSession`, the handshake loop, and `Finalize`. On any
    /// failure after a session context was minted, a best-effort
    /// `EndSession` is issued before the error propagates.
    pub async fn establish(
        transport: Box<dyn EkmTransport>,
        tls_config: Arc<ClientConfig>,
        server_name: &str,
        attestation_evidence: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> StetResult<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| StetError::SessionInit(format!("bad server name {server_name}: {e}")))?;
        let tls = ClientConnection::new(tls_config, name)
            .map_err(|e| StetError::SessionInit(format!("TLS client setup: {e}")))?;

        let mut session = Self {
            transport,
            tls,
            shim: RecordShim::new(),
            context: Vec::new(),
            state: SessionState::Init,
        };

        match session.run_establish(attestation_evidence, cancel).await {
            Ok(()) => Ok(session),
            Err(error) => {
                if !session.context.is_empty() {
                    session.end().await;
                }
                Err(error)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn run_establish(
        &mut self,
        attestation_evidence: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> StetResult<()> {
        // Init → AwaitServerHello: ship the ClientHello.
        self.flush_tls_writes()
            .map_err(StetError::SessionInit)?;
        let client_hello = self.shim.take_outbound();

        let begin = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StetError::Cancelled),
            result = self.transport.begin_session(ekmpb::BeginSessionRequest {
                tls_records: client_hello,
            }) => result.map_err(|e| phase_error(e, Phase::Begin))?,
        };
        self.context = begin.session_context;
        self.state = SessionState::AwaitServerHello;

        // The first server record must be a handshake record carrying a
        // ServerHello.
        let records = &begin.tls_records;
        if records.len() < 6
            || records[0] != RECORD_TYPE_HANDSHAKE
            || records[5] != HANDSHAKE_TYPE_SERVER_HELLO
        {
            return Err(StetError::HandshakeFailed(
                "first server record is not a ServerHello".into(),
            ));
        }
        self.ingest(records.clone())
            .map_err(StetError::HandshakeFailed)?;
        self.state = SessionState::Handshaking;

        // Handshake flights until the inner TLS reports established.
        while self.tls.is_handshaking() {
            self.flush_tls_writes()
                .map_err(StetError::HandshakeFailed)?;
            let flight = self.shim.take_outbound();
            if flight.is_empty() {
                // Mid-handshake with nothing to send: the server's last
                // flight was incomplete and no progress is possible.
                return Err(StetError::HandshakeFailed("handshake stalled".into()));
            }
            let response = self.handshake_rpc(flight, cancel).await?;
            self.ingest(response)
                .map_err(StetError::HandshakeFailed)?;
        }

        // The client's final flight (e.g. its Finished) may still be
        // buffered; deliver it so the server finishes too.
        self.flush_tls_writes()
            .map_err(StetError::HandshakeFailed)?;
        let tail = self.shim.take_outbound();
        if !tail.is_empty() {
            let response = self.handshake_rpc(tail, cancel).await?;
            self.ingest(response)
                .map_err(StetError::HandshakeFailed)?;
        }
        self.state = SessionState::Finalising;
        debug!(suite = ?self.tls.negotiated_cipher_suite(), "inner TLS established");

        let finalize = ekmpb::FinalizeRequest {
            session_context: self.context.clone(),
            attestation_evidence: attestation_evidence.unwrap_or_default(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StetError::Cancelled),
            result = self.transport.finalize(finalize) =>  {
                result.map_err(|e| phase_error(e, Phase::Finalize))?;
            }
        }
        self.state = SessionState::Open;
        Ok(())
    }

    async fn handshake_rpc(
        &mut self,
        flight: Vec<u8>,
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        let request = ekmpb::HandshakeRequest {
            session_context: self.context.clone(),
            tls_records: flight,
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StetError::Cancelled),
            result = self.transport.handshake(request) => {
                result.map_err(|e| phase_error(e, Phase::Handshake))?
            }
        };
        Ok(response.tls_records)
    }

    /// Encrypts `plaintext` into the tunnel and returns the wrapped blob
    /// the EKM sent back through it.
    pub async fn wrap(
        &mut self,
        key_path: &str,
        resource_name: &str,
        plaintext: &[u8],
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        self.require_open()?;
        let records = self
            .seal_payload(plaintext)
            .map_err(StetError::ConfidentialWrapFailed)?;

        let request = ekmpb::ConfidentialWrapRequest {
            session_context: self.context.clone(),
            key_path: key_path.to_string(),
            resource_name: resource_name.to_string(),
            tls_records: records,
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StetError::Cancelled),
            result = self.transport.confidential_wrap(request) => {
                result.map_err(|e| phase_error(e, Phase::Wrap))?
            }
        };
        self.open_payload(response.tls_records)
            .map_err(StetError::ConfidentialWrapFailed)
    }

    /// Decrypts a wrapped blob through the tunnel, returning the plaintext
    /// share.
    pub async fn unwrap(
        &mut self,
        key_path: &str,
        resource_name: &str,
        wrapped: &[u8],
        cancel: &CancellationToken,
    ) -> StetResult<Vec<u8>> {
        self.require_open()?;
        let records = self
            .seal_payload(wrapped)
            .map_err(StetError::ConfidentialUnwrapFailed)?;

        let request = ekmpb::ConfidentialUnwrapRequest {
            session_context: self.context.clone(),
            key_path: key_path.to_string(),
            resource_name: resource_name.to_string(),
            tls_records: records,
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StetError::Cancelled),
            result = self.transport.confidential_unwrap(request) => {
                result.map_err(|e| phase_error(e, Phase::Unwrap))?
            }
        };
        self.open_payload(response.tls_records)
            .map_err(StetError::ConfidentialUnwrapFailed)
    }

    /// Tears the session down. Idempotent; failures are logged as warnings
    /// because teardown runs after the operation's outcome is already
    /// decided.
    pub async fn end(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        let request = ekmpb::EndSessionRequest {
            session_context: self.context.clone(),
        };
        if let Err(error) = self.transport.end_session(request).await {
            warn!(%error, "EndSession failed during teardown");
        }
    }

    fn require_open(&self) -> StetResult<()> {
        if self.state != SessionState::Open {
            return Err(StetError::SessionState {
                state: self.state.name(),
                required: SessionState::Open.name(),
            });
        }
        Ok(())
    }

    fn seal_payload(&mut self, payload: &[u8]) -> Result<Vec<u8>, String> {
        self.tls
            .writer()
            .write_all(payload)
            .map_err(|e| format!("TLS write: {e}"))?;
        self.flush_tls_writes()?;
        Ok(self.shim.take_outbound())
    }

    fn open_payload(&mut self, records: Vec<u8>) -> Result<Vec<u8>, String> {
        self.ingest(records)?;
        let mut payload = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.tls.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => payload.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(format!("TLS read: {e}")),
            }
        }
        if payload.is_empty() {
            return Err("no payload inside TLS response".into());
        }
        Ok(payload)
    }

    fn flush_tls_writes(&mut self) -> Result<(), String> {
        while self.tls.wants_write() {
            self.tls
                .write_tls(&mut self.shim)
                .map_err(|e| format!("draining TLS records: {e}"))?;
        }
        Ok(())
    }

    fn ingest(&mut self, records: Vec<u8>) -> Result<(), String> {
        self.shim.push_inbound(&records);
        while !self.shim.inbound_is_empty() {
            let consumed = self
                .tls
                .read_tls(&mut self.shim)
                .map_err(|e| format!("feeding TLS records: {e}"))?;
            if consumed == 0 {
                break;
            }
            self.tls
                .process_new_packets()
                .map_err(|e| format!("processing TLS records: {e}"))?;
        }
        Ok(())
    }
}

enum Phase {
    Begin,
    Handshake,
    Finalize,
    Wrap,
    Unwrap,
}

/// Maps a transport error onto the failing protocol phase, letting
/// cancellation through untouched.
fn phase_error(error: StetError, phase: Phase) -> StetError {
    if matches!(error, StetError::Cancelled) {
        return error;
    }
    let message = error.to_string();
    match phase {
        Phase::Begin => StetError::SessionInit(message),
        Phase::Handshake => StetError::HandshakeFailed(message),
        Phase::Finalize => StetError::Finalize(message),
        Phase::Wrap => StetError::ConfidentialWrapFailed(message),
        Phase::Unwrap => StetError::ConfidentialUnwrapFailed(message),
    }
}
