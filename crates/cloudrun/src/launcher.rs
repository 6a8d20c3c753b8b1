//! # Host Launchers
//!
//! A [`HostLauncher`] turns "I need a host" into a bus address a host server
//! answers on, and tears hosts down again. Cloud provisioning backends
//! implement it outside this crate; [`LocalLauncher`] runs host servers as
//! tasks in the current process.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cloudrpc::HostId;
use dashmap::DashMap;
use tracing::info;

use crate::config::HostConfig;
use crate::ledger::ClassProvider;
use crate::server::HostServer;
use crate::telemetry::EventSink;
use crate::telemetry::NullSink;
use crate::transport::Transport;
use crate::transport::host_queue;

#[async_trait::async_trait]
pub trait HostLauncher: Send + Sync + 'static {
    /// Starts a host and returns its request address once it is serving.
    async fn launch(&self, host: HostId, size: Option<&str>) -> anyhow::Result<String>;

    async fn terminate(&self, address: &str) -> anyhow::Result<()>;
}

/// Launches [`HostServer`]s on a shared transport inside this process.
pub struct LocalLauncher {
    transport: Arc<dyn Transport>,
    provider: Arc<dyn ClassProvider>,
    config: HostConfig,
    sink: Arc<dyn EventSink>,
    servers: DashMap<String, HostServer>,
    startup_delay: Duration,
    failures_to_inject: AtomicUsize,
    launched: AtomicUsize,
    terminated: AtomicUsize,
}

impl LocalLauncher {
    pub fn new(transport: Arc<dyn Transport>, provider: Arc<dyn ClassProvider>, config: HostConfig) -> Self {
        Self {
            transport,
            provider,
            config,
            sink: Arc::new(NullSink),
            servers: DashMap::new(),
            startup_delay: Duration::ZERO,
            failures_to_inject: AtomicUsize::new(0),
            launched: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
        }
    }

    /// Sink handed to every launched server.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Simulated boot time of each host.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Makes the next `count` launches fail.
    pub fn fail_next_launches(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::Relaxed);
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::Relaxed)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::Relaxed)
    }

    pub fn server(&self, address: &str) -> Option<HostServer> {
        self.servers.get(address).map(|s| s.value().clone())
    }

    pub fn running(&self) -> usize {
        self.servers.len()
    }
}

#[async_trait::async_trait]
impl HostLauncher for LocalLauncher {
    async fn launch(&self, host: HostId, size: Option<&str>) -> anyhow::Result<String> {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }
        let injected = self
            .failures_to_inject
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("launch of {} refused", host);
        }

        let address = host_queue(&self.config.namespace, host);
        let server = HostServer::start(
            address.clone(),
            self.transport.clone(),
            self.provider.clone(),
            self.config.clone(),
            self.sink.clone(),
        )
        .await?;
        self.servers.insert(address.clone(), server);
        self.launched.fetch_add(1, Ordering::Relaxed);
        info!(host_id = %host, address = %address, size = size.unwrap_or("default"), "local host launched");
        Ok(address)
    }

    async fn terminate(&self, address: &str) -> anyhow::Result<()> {
        let Some((_, server)) = self.servers.remove(address) else {
            anyhow::bail!("no local host at {}", address);
        };
        server.shutdown();
        self.terminated.fetch_add(1, Ordering::Relaxed);
        info!(address = %address, "local host terminated");
        Ok(())
    }
}
