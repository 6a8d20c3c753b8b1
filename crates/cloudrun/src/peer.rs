//! # Correlated Peer with Async Pump
//!
//! This module provides the `Peer` abstraction for request/response exchanges
//! over a [`Transport`]. Each peer owns a private reply queue. A background pump
//! task reads that queue and routes every response to the pending request with
//! the same correlation id.
//!
//! ## Invariants
//!
//! - A pending entry exists only while its caller is waiting. Responses,
//!   timeouts, send failures and dropped callers all remove it.
//! - A response for an unknown correlation id (late, duplicate) is discarded.
//! - Incoming requests are handed to listener handlers one task per message,
//!   so a slow handler never blocks unrelated traffic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cloudrpc::Body;
use cloudrpc::ClientId;
use cloudrpc::Codec;
use cloudrpc::CorrelationId;
use cloudrpc::Envelope;
use cloudrpc::Request;
use cloudrpc::Response;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::transport;
use crate::transport::Destination;
use crate::transport::Transport;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] transport::Error),
    #[error("codec error: {0}")]
    Codec(#[from] cloudrpc::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("response channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

type Pending = Arc<DashMap<CorrelationId, oneshot::Sender<Result<Response>>>>;

/// Removes the pending entry however the waiting future ends.
struct PendingGuard<'a> {
    pending: &'a DashMap<CorrelationId, oneshot::Sender<Result<Response>>>,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct Peer {
    name: String,
    transport: Arc<dyn Transport>,
    codec: Codec,
    reply_queue: String,
    pending: Pending,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Subscribes to `reply_queue` and spawns the response pump.
    pub async fn connect(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        codec: Codec,
        reply_queue: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let reply_queue = reply_queue.into();
        let mut replies = transport.subscribe(&Destination::Queue(reply_queue.clone())).await?;
        let pending: Pending = Arc::new(DashMap::new());

        let pump_pending = pending.clone();
        let pump_name = name.clone();
        let pump = tokio::spawn(async move {
            while let Some(bytes) = replies.recv().await {
                Self::handle_reply(&pump_name, codec, &bytes, &pump_pending);
            }
            debug!(peer = %pump_name, "reply queue closed");
            Self::notify_all_pending(
                &pump_pending,
                Error::Transport(transport::Error::ConnectionLost("reply queue closed".into())),
            );
        });

        Ok(Self {
            name,
            transport,
            codec,
            reply_queue,
            pending,
            tasks: Mutex::new(vec![pump]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn notify_all_pending(pending: &DashMap<CorrelationId, oneshot::Sender<Result<Response>>>, error: Error) {
        let keys: Vec<CorrelationId> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    fn handle_reply(
        name: &str,
        codec: Codec,
        bytes: &[u8],
        pending: &DashMap<CorrelationId, oneshot::Sender<Result<Response>>>,
    ) {
        let envelope: Envelope = match codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %name, error = %e, "dropping undecodable reply");
                return;
            }
        };
        let Body::Response(response) = envelope.body else {
            warn!(peer = %name, correlation_id = %envelope.correlation_id, "request arrived on reply queue");
            return;
        };
        match pending.remove(&envelope.correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(response));
            }
            None => {
                trace!(peer = %name, correlation_id = %envelope.correlation_id, "late response dropped");
            }
        }
    }

    /// Sends a request and waits for the correlated response.
    pub async fn request(
        &self,
        destination: &Destination,
        client: Option<ClientId>,
        request: Request,
        timeout: Duration,
    ) -> Result<Response> {
        let correlation_id = CorrelationId::new();
        let kind = request.kind();
        let envelope = Envelope::request(correlation_id, client, Some(self.reply_queue.clone()), request);
        let payload = self.codec.encode(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        trace!(peer = %self.name, %correlation_id, destination = %destination, kind, "request");
        self.transport.publish(destination, payload).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                debug!(peer = %self.name, %correlation_id, kind, ?timeout, "request timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget.
    pub async fn send(&self, destination: &Destination, client: Option<ClientId>, request: Request) -> Result<()> {
        let envelope = Envelope::request(CorrelationId::new(), client, None, request);
        let payload = self.codec.encode(&envelope)?;
        self.transport.publish(destination, payload).await?;
        Ok(())
    }

    /// Answers a request received through a listener.
    pub async fn respond(&self, reply_to: &str, correlation_id: CorrelationId, response: Response) -> Result<()> {
        let envelope = Envelope::response(correlation_id, response);
        let payload = self.codec.encode(&envelope)?;
        self.transport.publish(&Destination::Queue(reply_to.to_string()), payload).await?;
        Ok(())
    }

    /// Consumes `destination` and spawns `handler` for every envelope that
    /// passes `predicate`. Undecodable messages are logged and dropped.
    pub async fn listen<P, H, Fut>(&self, destination: Destination, predicate: P, handler: H) -> Result<()>
    where
        P: Fn(&Envelope) -> bool + Send + Sync + 'static,
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.transport.subscribe(&destination).await?;
        let codec = self.codec;
        let name = self.name.clone();
        let handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                let envelope: Envelope = match codec.decode(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(peer = %name, destination = %destination, error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                if !predicate(&envelope) {
                    trace!(peer = %name, correlation_id = %envelope.correlation_id, "message filtered");
                    continue;
                }
                let handler = handler.clone();
                tokio::spawn(async move { handler(envelope).await });
            }
            debug!(peer = %name, destination = %destination, "listener closed");
        });

        self.tasks.lock().push(task);
        Ok(())
    }

    /// Stops the pump and every listener. Waiting requests fail with
    /// `ChannelClosed`.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Self::notify_all_pending(&self.pending, Error::ChannelClosed);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
