//! # Host Discovery
//!
//! Finds hosts that were started outside this manager. A probe goes out on
//! the namespace's discovery topic; the first host to answer wins.

use std::sync::Arc;
use std::time::Duration;

use cloudrpc::Request;
use cloudrpc::Response;
use tracing::debug;

use crate::peer;
use crate::peer::Peer;
use crate::transport::Destination;
use crate::transport::discovery_topic;

#[async_trait::async_trait]
pub trait HostDiscovery: Send + Sync + 'static {
    /// The address of a running host, or `None` if nobody answered in time.
    async fn discover(&self, timeout: Duration) -> anyhow::Result<Option<String>>;
}

/// Probes the discovery topic through a [`Peer`].
pub struct BusDiscovery {
    peer: Arc<Peer>,
    topic: Destination,
}

impl BusDiscovery {
    pub fn new(peer: Arc<Peer>, namespace: &str) -> Self {
        Self {
            peer,
            topic: Destination::Topic(discovery_topic(namespace)),
        }
    }
}

#[async_trait::async_trait]
impl HostDiscovery for BusDiscovery {
    async fn discover(&self, timeout: Duration) -> anyhow::Result<Option<String>> {
        match self.peer.request(&self.topic, None, Request::Probe, timeout).await {
            Ok(Response::ProbeReply { address }) => {
                debug!(topic = %self.topic, address = %address, "host discovered");
                Ok(Some(address))
            }
            Ok(other) => anyhow::bail!("unexpected reply to probe: {}", other.kind()),
            Err(peer::Error::Timeout(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
