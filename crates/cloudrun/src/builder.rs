//! Assembles a [`CloudManager`] from a transport, a launcher and optional
//! policy, configuration, event sink and discovery.

use std::sync::Arc;

use cloudrpc::ClientId;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::discovery::BusDiscovery;
use crate::discovery::HostDiscovery;
use crate::error::Result;
use crate::launcher::HostLauncher;
use crate::manager::CloudManager;
use crate::manager::ManagerParts;
use crate::peer::Peer;
use crate::policy::ScalingPolicy;
use crate::policy::SingleHostPolicy;
use crate::pool::HostPool;
use crate::reference;
use crate::reference::ReferenceTable;
use crate::telemetry::EventSink;
use crate::telemetry::TracingSink;
use crate::transport::Transport;

pub struct CloudManagerBuilder {
    transport: Arc<dyn Transport>,
    launcher: Arc<dyn HostLauncher>,
    policy: Option<Arc<dyn ScalingPolicy>>,
    config: RuntimeConfig,
    sink: Option<Arc<dyn EventSink>>,
    discovery: Option<Arc<dyn HostDiscovery>>,
    client_id: Option<ClientId>,
}

impl CloudManagerBuilder {
    pub fn new(transport: Arc<dyn Transport>, launcher: Arc<dyn HostLauncher>) -> Self {
        Self {
            transport,
            launcher,
            policy: None,
            config: RuntimeConfig::default(),
            sink: None,
            discovery: None,
            client_id: None,
        }
    }

    /// Defaults to [`SingleHostPolicy`].
    pub fn policy(mut self, policy: impl ScalingPolicy) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn shared_policy(mut self, policy: Arc<dyn ScalingPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`TracingSink`].
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to probing the namespace's discovery topic.
    pub fn discovery(mut self, discovery: Arc<dyn HostDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn client_id(mut self, id: ClientId) -> Self {
        self.client_id = Some(id);
        self
    }

    /// Validates the configuration, opens the reply and callback queues,
    /// registers static hosts and starts the background timers.
    pub async fn start(self) -> Result<CloudManager> {
        self.config.validate()?;
        let config = self.config;
        let client_id = self.client_id.unwrap_or_default();
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn EventSink>);

        let reply_queue = format!("{}.client.{}", config.namespace, client_id);
        let peer = Arc::new(Peer::connect(client_id.to_string(), self.transport, config.codec, reply_queue.clone()).await?);
        let references = Arc::new(ReferenceTable::new());
        let callback_queue = format!("{}.callbacks", reply_queue);
        reference::serve(&peer, &callback_queue, references.clone()).await?;

        let pool = HostPool::new(self.launcher, sink.clone(), config.default_host_size.clone());
        for address in &config.static_hosts {
            pool.register_static(address.clone());
        }

        let discovery = self
            .discovery
            .unwrap_or_else(|| Arc::new(BusDiscovery::new(peer.clone(), &config.namespace)) as Arc<dyn HostDiscovery>);
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(SingleHostPolicy::new()) as Arc<dyn ScalingPolicy>);

        info!(
            client_id = %client_id,
            namespace = %config.namespace,
            codec = config.codec.name(),
            static_hosts = config.static_hosts.len(),
            "cloud manager started"
        );

        let manager = CloudManager::assemble(ManagerParts {
            client_id,
            config,
            peer,
            pool,
            policy,
            discovery,
            sink,
            references,
            callback_queue,
        });
        manager.spawn_timers();
        Ok(manager)
    }
}
