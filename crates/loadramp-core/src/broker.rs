//! Broker collaborator contract
//!
//! The harness only ever talks to a broker through these two traits. The
//! `loadramp-broker` crate provides a gRPC implementation and an in-process
//! one; tests provide their own.

use async_trait::async_trait;

use crate::error::CallError;

/// Publish call arguments
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub subject: String,
    pub body: Vec<u8>,
    pub expiration_seconds: i32,
}

/// Fetch call arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub subject: String,
    pub id: i32,
}

/// Successful publish: the broker-assigned message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReply {
    pub id: i32,
}

/// Successful fetch: the stored message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReply {
    pub body: Vec<u8>,
}

/// Opens channels to the broker. Shared by every worker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Human readable endpoint, used in logs
    fn endpoint(&self) -> &str;

    /// Establish a new channel
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, CallError>;
}

/// One established channel, owned by a single session
#[async_trait]
pub trait BrokerChannel: Send {
    async fn publish(&mut self, request: PublishRequest) -> Result<PublishReply, CallError>;

    async fn fetch(&mut self, request: FetchRequest) -> Result<FetchReply, CallError>;

    /// Release the channel. Called exactly once by the owning session.
    async fn close(&mut self);
}
