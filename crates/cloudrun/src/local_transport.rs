//! In-process broker.
//!
//! Backs the local platform (hosts running as tasks inside this process) and
//! the test suites. Queues deliver round robin, topics broadcast, and nothing
//! is buffered for destinations without consumers.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::transport;
use crate::transport::Destination;
use crate::transport::Subscription;
use crate::transport::Transport;

type Consumer = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Default)]
struct QueueState {
    consumers: Vec<Consumer>,
    next: usize,
}

#[derive(Default)]
pub struct LocalTransport {
    queues: DashMap<String, QueueState>,
    topics: DashMap<String, Vec<Consumer>>,
    dropped: AtomicU64,
    severed: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages discarded because no consumer was listening.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Simulates losing the broker connection: every publish and subscribe fails
    /// until the link is restored.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Relaxed);
    }

    pub fn restore(&self) {
        self.severed.store(false, Ordering::Relaxed);
    }

    fn check_link(&self) -> transport::Result<()> {
        if self.severed.load(Ordering::Relaxed) {
            return Err(transport::Error::ConnectionLost("local broker severed".into()));
        }
        Ok(())
    }

    fn deliver_to_queue(&self, name: &str, payload: Vec<u8>) -> bool {
        let Some(mut queue) = self.queues.get_mut(name) else {
            return false;
        };
        queue.consumers.retain(|c| !c.is_closed());

        let mut payload = payload;
        while !queue.consumers.is_empty() {
            let index = queue.next % queue.consumers.len();
            queue.next = queue.next.wrapping_add(1);
            match queue.consumers[index].send(payload) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    queue.consumers.remove(index);
                    payload = returned;
                }
            }
        }
        false
    }

    fn deliver_to_topic(&self, name: &str, payload: Vec<u8>) -> bool {
        let Some(mut consumers) = self.topics.get_mut(name) else {
            return false;
        };
        consumers.retain(|c| c.send(payload.clone()).is_ok());
        !consumers.is_empty()
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, destination: &Destination, payload: Vec<u8>) -> transport::Result<()> {
        self.check_link()?;
        let delivered = match destination {
            Destination::Queue(name) => self.deliver_to_queue(name, payload),
            Destination::Topic(name) => self.deliver_to_topic(name, payload),
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(destination = %destination, "no consumer, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, destination: &Destination) -> transport::Result<Subscription> {
        self.check_link()?;
        if destination.name().is_empty() {
            return Err(transport::Error::InvalidDestination("empty name".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match destination {
            Destination::Queue(name) => self.queues.entry(name.clone()).or_default().consumers.push(tx),
            Destination::Topic(name) => self.topics.entry(name.clone()).or_default().push(tx),
        }
        Ok(Subscription::new(rx))
    }
}
