//! Broker channels for loadramp
//!
//! - [`grpc`]: talks to a real `broker.Broker` gRPC service
//! - [`memory`]: in-process broker with the same publish/fetch semantics

pub mod grpc;
pub mod memory;

use std::sync::Arc;

use loadramp_core::{BrokerConnector, BrokerSettings, CallError};

pub use grpc::{GrpcChannel, GrpcConnector};
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnector, StoreError};

/// Target name that selects the in-process broker
pub const MEMORY_TARGET: &str = "memory";

/// Pick a connector for the configured target
pub fn connector_for(settings: &BrokerSettings) -> Result<Arc<dyn BrokerConnector>, CallError> {
    if settings.target == MEMORY_TARGET {
        return Ok(Arc::new(MemoryConnector::new(MemoryBroker::new())));
    }
    let connector = GrpcConnector::from_settings(settings);
    connector.endpoint_config()?;
    Ok(Arc::new(connector))
}
