pub mod config;
pub mod error;
pub mod uri;

pub use error::{StetError, StetResult};

/// Generated gRPC types and service traits (from kms.proto / ekm.proto)
pub mod proto {
    pub mod kms {
        pub mod v1 {
            tonic::include_proto!("stet.kms.v1");
        }
    }
    pub mod ekm {
        pub mod v1 {
            tonic::include_proto!("stet.ekm.v1");
        }
    }
}

/// User-agent string sent on every outbound RPC. The version is stamped at
/// build time; development builds report `dev`.
pub fn user_agent() -> String {
    format!("STET/{}", option_env!("STET_VERSION").unwrap_or("dev"))
}
