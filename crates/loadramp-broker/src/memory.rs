//! In-process broker for dry runs and tests
//!
//! Messages are kept per subject. Ids start at 1 and grow by one per publish
//! on that subject. A message can be fetched until its expiration elapses.
//! Expired messages are evicted by a sweep that runs at most once per
//! [`PRUNE_INTERVAL`] on publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use loadramp_core::{
    BrokerChannel, BrokerConnector, CallError, FetchReply, FetchRequest, PublishReply,
    PublishRequest,
};

/// Store-level failures, surfaced to callers as gRPC-style statuses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("broker is unavailable")]
    Unavailable,

    #[error("invalid argument for id={0}; message expired or not found")]
    InvalidId(i32),

    #[error("invalid argument for id={0}; message expired or not found")]
    Expired(i32),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable => "Unavailable",
            Self::InvalidId(_) | Self::Expired(_) => "InvalidArgument",
        }
    }
}

impl From<StoreError> for CallError {
    fn from(err: StoreError) -> Self {
        CallError::Status {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Minimum time between two sweeps of expired messages
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct StoredMessage {
    body: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct SubjectStore {
    last_id: i32,
    messages: HashMap<i32, StoredMessage>,
}

#[derive(Debug, Default)]
struct Store {
    subjects: HashMap<String, SubjectStore>,
    next_prune: Option<Instant>,
}

impl Store {
    fn prune(&mut self, now: Instant) {
        if self.next_prune.map_or(false, |at| now < at) {
            return;
        }
        self.next_prune = Some(now + PRUNE_INTERVAL);
        for store in self.subjects.values_mut() {
            store.messages.retain(|_, m| now <= m.deadline);
        }
    }
}

/// Shared in-memory message store
#[derive(Debug, Default)]
pub struct MemoryBroker {
    store: Mutex<Store>,
    closed: AtomicBool,
    latency: Duration,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Broker that delays every call by `latency`
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    /// Stop accepting connections and calls
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Store a message and return its id on the subject
    pub fn publish(&self, subject: &str, body: Vec<u8>, expiration: Duration) -> Result<i32, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Unavailable);
        }
        let now = Instant::now();
        let mut store = self.store.lock();
        store.prune(now);
        let subject = store.subjects.entry(subject.to_string()).or_default();
        subject.last_id += 1;
        let id = subject.last_id;
        subject.messages.insert(
            id,
            StoredMessage {
                body,
                deadline: now + expiration,
            },
        );
        Ok(id)
    }

    pub fn fetch(&self, subject: &str, id: i32) -> Result<Vec<u8>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Unavailable);
        }
        let store = self.store.lock();
        let message = store
            .subjects
            .get(subject)
            .and_then(|s| s.messages.get(&id))
            .ok_or(StoreError::InvalidId(id))?;
        if Instant::now() > message.deadline {
            return Err(StoreError::Expired(id));
        }
        Ok(message.body.clone())
    }

    /// Messages stored across all subjects, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.store
            .lock()
            .subjects
            .values()
            .map(|s| s.messages.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// Hands out channels onto one [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    fn endpoint(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, CallError> {
        if self.broker.is_closed() {
            return Err(CallError::Connect(StoreError::Unavailable.to_string()));
        }
        Ok(Box::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            open: true,
        }))
    }
}

pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    open: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), CallError> {
        if self.open {
            Ok(())
        } else {
            Err(CallError::Transport("channel already closed".into()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&mut self, request: PublishRequest) -> Result<PublishReply, CallError> {
        self.ensure_open()?;
        self.broker.delay().await;
        let expiration = Duration::from_secs(request.expiration_seconds.max(0) as u64);
        let id = self.broker.publish(&request.subject, request.body, expiration)?;
        Ok(PublishReply { id })
    }

    async fn fetch(&mut self, request: FetchRequest) -> Result<FetchReply, CallError> {
        self.ensure_open()?;
        self.broker.delay().await;
        let body = self.broker.fetch(&request.subject, request.id)?;
        Ok(FetchReply { body })
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
