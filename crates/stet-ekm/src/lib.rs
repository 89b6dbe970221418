//! stet-ekm: confidential wrap/unwrap through an external key manager.
//!
//! An inner TLS 1.2/1.3 session is carried inside the EKM's RPC surface.
//! The TLS engine never touches a socket: a byte-buffer shim turns its
//! record stream into discrete RPC payloads. Once the session is
//! established and finalized, share material crosses the wire only inside
//! the inner TLS stream.

pub mod session;
pub mod shim;
pub mod tls;
pub mod token;
pub mod transport;

pub use session::{EkmTransport, SecureSession, SessionState};
pub use shim::RecordShim;
pub use tls::build_client_config;
pub use token::{StaticTokenProvider, TokenProvider};
pub use transport::EkmGrpcTransport;
