//! gRPC channel to a `broker.Broker` service
//!
//! The service is small enough that the messages are declared by hand with
//! `prost` derives and the two unary methods are called through
//! `tonic::client::Grpc` directly.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use loadramp_core::{
    BrokerChannel, BrokerConnector, BrokerSettings, CallError, FetchReply, FetchRequest,
    PublishReply, PublishRequest,
};

const PUBLISH_PATH: &str = "/broker.Broker/Publish";
const FETCH_PATH: &str = "/broker.Broker/Fetch";

/// Wire messages of the `broker` package
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PublishRequest {
        #[prost(string, tag = "1")]
        pub subject: ::prost::alloc::string::String,
        #[prost(bytes = "vec", tag = "2")]
        pub body: ::prost::alloc::vec::Vec<u8>,
        #[prost(int32, tag = "3")]
        pub expiration_seconds: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PublishResponse {
        #[prost(int32, tag = "1")]
        pub id: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FetchRequest {
        #[prost(string, tag = "1")]
        pub subject: ::prost::alloc::string::String,
        #[prost(int32, tag = "2")]
        pub id: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MessageResponse {
        #[prost(bytes = "vec", tag = "1")]
        pub body: ::prost::alloc::vec::Vec<u8>,
    }
}

/// Dials a fresh HTTP/2 channel per session
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    uri: String,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(uri: impl Into<String>, connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout,
            call_timeout,
        }
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(settings.uri(), settings.connect_timeout, settings.call_timeout)
    }

    /// Parse the endpoint without dialing, so a malformed target fails the run up front
    pub fn endpoint_config(&self) -> Result<Endpoint, CallError> {
        Endpoint::from_shared(self.uri.clone())
            .map(|e| e.connect_timeout(self.connect_timeout).timeout(self.call_timeout))
            .map_err(|e| CallError::Connect(format!("invalid endpoint {}: {}", self.uri, e)))
    }
}

#[async_trait]
impl BrokerConnector for GrpcConnector {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, CallError> {
        let endpoint = self.endpoint_config()?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| CallError::Connect(e.to_string()))?;
        debug!("Connected to {}", self.uri);
        Ok(Box::new(GrpcChannel {
            client: Some(Grpc::new(channel)),
            call_timeout: self.call_timeout,
        }))
    }
}

/// One open connection to the broker
pub struct GrpcChannel {
    client: Option<Grpc<Channel>>,
    call_timeout: Duration,
}

impl GrpcChannel {
    fn client(&mut self) -> Result<&mut Grpc<Channel>, CallError> {
        self.client
            .as_mut()
            .ok_or_else(|| CallError::Transport("channel already closed".into()))
    }
}

async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| CallError::Timeout(deadline.as_millis() as u64))?
}

fn status_error(status: tonic::Status) -> CallError {
    CallError::Status {
        code: format!("{:?}", status.code()),
        message: status.message().to_string(),
    }
}

#[async_trait]
impl BrokerChannel for GrpcChannel {
    async fn publish(&mut self, request: PublishRequest) -> Result<PublishReply, CallError> {
        let deadline = self.call_timeout;
        let client = self.client()?;
        let message = proto::PublishRequest {
            subject: request.subject,
            body: request.body,
            expiration_seconds: request.expiration_seconds,
        };
        let response = with_deadline(deadline, async {
            client
                .ready()
                .await
                .map_err(|e| CallError::Transport(e.to_string()))?;
            let codec: ProstCodec<proto::PublishRequest, proto::PublishResponse> = ProstCodec::default();
            client
                .unary(
                    tonic::Request::new(message),
                    PathAndQuery::from_static(PUBLISH_PATH),
                    codec,
                )
                .await
                .map_err(status_error)
        })
        .await?;
        Ok(PublishReply {
            id: response.into_inner().id,
        })
    }

    async fn fetch(&mut self, request: FetchRequest) -> Result<FetchReply, CallError> {
        let deadline = self.call_timeout;
        let client = self.client()?;
        let message = proto::FetchRequest {
            subject: request.subject,
            id: request.id,
        };
        let response = with_deadline(deadline, async {
            client
                .ready()
                .await
                .map_err(|e| CallError::Transport(e.to_string()))?;
            let codec: ProstCodec<proto::FetchRequest, proto::MessageResponse> = ProstCodec::default();
            client
                .unary(
                    tonic::Request::new(message),
                    PathAndQuery::from_static(FETCH_PATH),
                    codec,
                )
                .await
                .map_err(status_error)
        })
        .await?;
        Ok(FetchReply {
            body: response.into_inner().body,
        })
    }

    async fn close(&mut self) {
        // dropping the last handle tears down the connection
        self.client.take();
    }
}
