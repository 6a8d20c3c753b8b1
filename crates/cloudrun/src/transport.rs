//! # Transport Abstraction
//!
//! A minimal, async interface over a publish/subscribe broker.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about envelopes or codecs.
//!   It moves opaque buffers between named destinations.
//! - **Two Destination Kinds**: a queue hands each message to exactly one of its
//!   subscribers; a topic hands each message to all of them.
//! - **Transient**: a message published to a destination nobody listens on is
//!   dropped. Correlation, deadlines and replies are built on top of this in
//!   [`crate::peer`], not here.

use std::fmt;

use tokio::sync::mpsc;

/// Errors that occur at the broker layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The broker is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The destination name is not acceptable to the broker.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    /// Generic I/O error or internal transport failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Queue(name) | Self::Topic(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "queue:{}", name),
            Self::Topic(name) => write!(f, "topic:{}", name),
        }
    }
}

/// Name of the topic hosts listen on for discovery probes.
pub fn discovery_topic(namespace: &str) -> String {
    format!("{}.discovery", namespace)
}

/// Name of the request queue of a host.
pub fn host_queue(namespace: &str, host: impl fmt::Display) -> String {
    format!("{}.host.{}", namespace, host)
}

/// A stream of messages from one destination. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the broker closed the subscription.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A broker connection.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publishes a payload. Succeeds even if nobody is listening.
    ///
    /// # invariants
    /// - Must return `Err` if the broker cannot be reached.
    /// - Should not interpret the payload content.
    async fn publish(&self, destination: &Destination, payload: Vec<u8>) -> Result<()>;

    /// Starts consuming from a destination.
    async fn subscribe(&self, destination: &Destination) -> Result<Subscription>;
}
