//! gRPC transport for the EKM surface. Every call carries the bearer token
//! as `authorization` metadata; payload confidentiality comes from the
//! inner TLS session, not from this channel.

use async_trait::async_trait;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use stet_core::proto::ekm::v1 as ekmpb;
use stet_core::proto::ekm::v1::confidential_ekm_client::ConfidentialEkmClient;
use stet_core::{StetError, StetResult};

pub struct EkmGrpcTransport {
    client: ConfidentialEkmClient<Channel>,
    authorization: MetadataValue<Ascii>,
}

impl EkmGrpcTransport {
    /// Connects to `endpoint` (`<scheme>://<host>[:port]`) and prepares the
    /// bearer credential attached to every RPC.
    pub async fn connect(endpoint: &str, bearer_token: &str) -> StetResult<Self> {
        let authorization: MetadataValue<Ascii> = format!("Bearer {bearer_token}")
            .parse()
            .map_err(|_| StetError::TokenIssuance("token is not valid metadata".into()))?;

        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| StetError::SessionInit(format!("bad EKM endpoint {endpoint}: {e}")))?
            .user_agent(stet_core::user_agent())
            .map_err(|e| StetError::SessionInit(format!("user agent: {e}")))?
            .connect()
            .await
            .map_err(|e| StetError::SessionInit(format!("connect {endpoint}: {e}")))?;

        Ok(Self {
            client: ConfidentialEkmClient::new(channel),
            authorization,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert("authorization", self.authorization.clone());
        request
    }
}

#[async_trait]
impl crate::session::EkmTransport for EkmGrpcTransport {
    async fn begin_session(
        &self,
        request: ekmpb::BeginSessionRequest,
    ) -> StetResult<ekmpb::BeginSessionResponse> {
        let mut client = self.client.clone();
        let response = client.begin_session(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn handshake(
        &self,
        request: ekmpb::HandshakeRequest,
    ) -> StetResult<ekmpb::HandshakeResponse> {
        let mut client = self.client.clone();
        let response = client.handshake(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn finalize(
        &self,
        request: ekmpb::FinalizeRequest,
    ) -> StetResult<ekmpb::FinalizeResponse> {
        let mut client = self.client.clone();
        let response = client.finalize(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn confidential_wrap(
        &self,
        request: ekmpb::ConfidentialWrapRequest,
    ) -> StetResult<ekmpb::ConfidentialWrapResponse> {
        let mut client = self.client.clone();
        let response = client.confidential_wrap(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn confidential_unwrap(
        &self,
        request: ekmpb::ConfidentialUnwrapRequest,
    ) -> StetResult<ekmpb::ConfidentialUnwrapResponse> {
        let mut client = self.client.clone();
        let response = client.confidential_unwrap(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn end_session(
        &self,
        request: ekmpb::EndSessionRequest,
    ) -> StetResult<ekmpb::EndSessionResponse> {
        let mut client = self.client.clone();
        let response = client.end_session(self.request(request)).await?;
        Ok(response.into_inner())
    }
}
