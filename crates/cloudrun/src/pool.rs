//! # Host Pool
//!
//! Owns the set of known hosts and starts or stops them through a
//! [`HostLauncher`].
//!
//! ## Concurrency
//!
//! The host list is guarded by one lock; every change to it goes through the
//! pool. Placement decisions additionally take the pool's placement lock (see
//! [`HostPool::placement_lock`]) so that choosing a host, possibly starting
//! it, and reserving a slot on it happen as one unit.
//!
//! A host is added to the list before its launch begins, so concurrent
//! placements see a `Starting` host instead of an empty pool.

use std::sync::Arc;

use cloudrpc::HostId;
use cloudrpc::ObjectId;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tracing::info;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::host::Host;
use crate::host::HostState;
use crate::launcher::HostLauncher;
use crate::telemetry::Event;
use crate::telemetry::EventSink;

struct PoolInner {
    launcher: Arc<dyn HostLauncher>,
    sink: Arc<dyn EventSink>,
    hosts: RwLock<Vec<Arc<Host>>>,
    placement: Mutex<()>,
    default_size: Option<String>,
}

#[derive(Clone)]
pub struct HostPool {
    inner: Arc<PoolInner>,
}

impl HostPool {
    pub fn new(launcher: Arc<dyn HostLauncher>, sink: Arc<dyn EventSink>, default_size: Option<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                sink,
                hosts: RwLock::new(Vec::new()),
                placement: Mutex::new(()),
                default_size,
            }),
        }
    }

    /// Serializes placement decisions. Held while a policy selects a host and
    /// while the caller reserves a slot on it.
    pub async fn placement_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.placement.lock().await
    }

    /// Starts a host and waits until it is running.
    pub async fn start_new_host(&self, size: Option<&str>) -> Result<Arc<Host>> {
        let host = self.register_starting(size);
        self.launch(host.clone()).await?;
        Ok(host)
    }

    /// Starts a host in the background and returns it while still `Starting`.
    /// Users of the handle wait with [`Host::wait_until_running`].
    pub fn start_new_host_async(&self, size: Option<&str>) -> Arc<Host> {
        let host = self.register_starting(size);
        let pool = self.clone();
        let launching = host.clone();
        tokio::spawn(async move {
            let _ = pool.launch(launching).await;
        });
        host
    }

    fn register_starting(&self, size: Option<&str>) -> Arc<Host> {
        let size = size.map(str::to_string).or_else(|| self.inner.default_size.clone());
        let host = Arc::new(Host::starting(HostId::new(), size));
        self.inner.hosts.write().push(host.clone());
        self.inner.sink.emit(Event::HostStarting { host: host.id() });
        info!(host_id = %host.id(), size = host.size().unwrap_or("default"), "starting host");
        host
    }

    async fn launch(&self, host: Arc<Host>) -> Result<()> {
        let inner = &self.inner;
        match inner.launcher.launch(host.id(), host.size()).await {
            Ok(address) => {
                if !host.mark_running(address.clone()) {
                    info!(host_id = %host.id(), address = %address, "host shut down while starting, terminating");
                    if let Err(e) = inner.launcher.terminate(&address).await {
                        warn!(host_id = %host.id(), error = %e, "terminate failed");
                    }
                    return Err(Error::HostLaunch(format!("{} was shut down while starting", host.id())));
                }
                info!(host_id = %host.id(), address = %address, "host running");
                inner.sink.emit(Event::HostStarted { host: host.id(), address });
                self.retire_if_drained(&host).await;
                Ok(())
            }
            Err(e) => {
                warn!(host_id = %host.id(), error = %e, "host launch failed");
                inner.hosts.write().retain(|h| h.id() != host.id());
                host.mark_terminated();
                inner.sink.emit(Event::HostLaunchFailed {
                    host: host.id(),
                    reason: e.to_string(),
                });
                Err(Error::HostLaunch(e.to_string()))
            }
        }
    }

    /// Adds a pre-started host. Static hosts are never terminated by the pool.
    pub fn register_static(&self, address: impl Into<String>) -> Arc<Host> {
        let address = address.into();
        let mut hosts = self.inner.hosts.write();
        if let Some(existing) = hosts.iter().find(|h| h.address().as_deref() == Some(address.as_str())) {
            return existing.clone();
        }
        let host = Arc::new(Host::fixed(address.clone()));
        hosts.push(host.clone());
        drop(hosts);
        info!(host_id = %host.id(), address = %address, "static host registered");
        host
    }

    /// Stops new placements on the host and terminates it once it is empty.
    pub async fn shutdown_host(&self, id: HostId) -> Result<()> {
        let host = self.drain(id)?;
        self.retire_if_drained(&host).await;
        Ok(())
    }

    /// Marks the host `Draining`. Returns it for a later [`Self::retire_if_drained`].
    pub fn drain(&self, id: HostId) -> Result<Arc<Host>> {
        let host = self.host(id).ok_or_else(|| Error::HostUnavailable {
            host: id,
            reason: "not in pool".into(),
        })?;
        let was_draining = host.state() == HostState::Draining;
        if !host.mark_draining() {
            return Err(Error::HostUnavailable {
                host: id,
                reason: "already terminated".into(),
            });
        }
        if !was_draining {
            self.inner.sink.emit(Event::HostDraining { host: id });
            info!(host_id = %id, objects = host.object_count(), "host draining");
        }
        Ok(host)
    }

    /// Terminates a draining host that has no objects left.
    pub async fn retire_if_drained(&self, host: &Arc<Host>) -> bool {
        if host.state() != HostState::Draining || host.object_count() != 0 {
            return false;
        }
        self.terminate(host).await;
        true
    }

    /// Terminates the host regardless of residents. Returns the ids that were
    /// resident so the caller can forget them.
    pub async fn force_shutdown_host(&self, id: HostId) -> Result<Vec<ObjectId>> {
        let host = self.drain(id)?;
        let lost = host.clear();
        self.terminate(&host).await;
        Ok(lost)
    }

    /// A host still starting has no address yet; its launch task terminates
    /// it once the launcher returns.
    async fn terminate(&self, host: &Arc<Host>) {
        self.inner.hosts.write().retain(|h| h.id() != host.id());
        let address = host.mark_terminated();
        if let (false, Some(address)) = (host.is_static(), address) {
            if let Err(e) = self.inner.launcher.terminate(&address).await {
                warn!(host_id = %host.id(), error = %e, "terminate failed");
            }
        }
        self.inner.sink.emit(Event::HostTerminated { host: host.id() });
        info!(host_id = %host.id(), "host terminated");
    }

    /// Snapshot in registration order.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.inner.hosts.read().clone()
    }

    pub fn hosts_count(&self) -> usize {
        self.inner.hosts.read().len()
    }

    pub fn host(&self, id: HostId) -> Option<Arc<Host>> {
        self.inner.hosts.read().iter().find(|h| h.id() == id).cloned()
    }

    pub fn count_cloud_objects(&self) -> usize {
        self.inner.hosts.read().iter().map(|h| h.resident_count()).sum()
    }

    pub fn cloud_objects(&self) -> Vec<ObjectId> {
        self.inner.hosts.read().iter().flat_map(|h| h.objects()).collect()
    }
}
