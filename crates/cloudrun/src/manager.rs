//! # Cloud Manager
//!
//! The client-side coordinator. A [`CloudManager`] places objects on hosts
//! through its [`ScalingPolicy`], forwards invocations and field access over
//! the bus, tracks which host each object lives on, and drives migration and
//! scale-down.
//!
//! ## Concurrency
//!
//! - Placement (policy call plus slot reservation) runs under the pool's
//!   placement lock; the remote construction itself does not.
//! - Each registered object has a gate. Invocations, field access and
//!   destroy take it shared, migration takes it exclusively, so no call is
//!   routed to a host the object is leaving.
//! - The registry is a plain mutex that is never held across an await.
//!
//! ## Invariants
//!
//! - An object is registered only after its host confirmed the construction.
//! - An object id is in at most one of `live` and `destroyed`, and stays in
//!   `destroyed` for the lifetime of the manager.
//! - An object's host is repointed only after the target confirmed a deploy.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cloudrpc::ClientId;
use cloudrpc::Codec;
use cloudrpc::FaultKind;
use cloudrpc::HostId;
use cloudrpc::ObjectId;
use cloudrpc::Reference;
use cloudrpc::Request;
use cloudrpc::Response;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::builder::CloudManagerBuilder;
use crate::config::RuntimeConfig;
use crate::discovery::HostDiscovery;
use crate::error::Error;
use crate::error::Result;
use crate::host::Host;
use crate::host::HostState;
use crate::launcher::HostLauncher;
use crate::ledger::Args;
use crate::migration::MigrationRecord;
use crate::migration::MigrationStage;
use crate::peer;
use crate::peer::Peer;
use crate::policy::ObjectDescriptor;
use crate::policy::ScalingPolicy;
use crate::pool::HostPool;
use crate::reference::CallbackTarget;
use crate::reference::ReferenceTable;
use crate::telemetry::Event;
use crate::telemetry::EventSink;
use crate::transport::Destination;
use crate::transport::Transport;

/// What `create_object` hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandle {
    pub id: ObjectId,
    pub class: String,
    pub host: HostId,
}

/// Client-side lifecycle of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Live,
    Migrating,
    Destroyed,
}

struct Entry {
    host: Arc<Host>,
    class: String,
    lifecycle: Lifecycle,
    gate: Arc<RwLock<()>>,
}

#[derive(Default)]
struct Registry {
    live: HashMap<ObjectId, Entry>,
    destroyed: HashSet<ObjectId>,
}

pub(crate) struct ManagerParts {
    pub client_id: ClientId,
    pub config: RuntimeConfig,
    pub peer: Arc<Peer>,
    pub pool: HostPool,
    pub policy: Arc<dyn ScalingPolicy>,
    pub discovery: Arc<dyn HostDiscovery>,
    pub sink: Arc<dyn EventSink>,
    pub references: Arc<ReferenceTable>,
    pub callback_queue: String,
}

struct ManagerInner {
    client_id: ClientId,
    config: RuntimeConfig,
    peer: Arc<Peer>,
    pool: HostPool,
    policy: Arc<dyn ScalingPolicy>,
    discovery: Arc<dyn HostDiscovery>,
    sink: Arc<dyn EventSink>,
    references: Arc<ReferenceTable>,
    callback_queue: String,
    registry: Mutex<Registry>,
    creating: AtomicUsize,
    timers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to the runtime. Cloning shares it.
#[derive(Clone)]
pub struct CloudManager {
    inner: Arc<ManagerInner>,
}

/// Keeps the in-flight creation count accurate on every exit path.
struct Creating<'a>(&'a AtomicUsize);

impl<'a> Creating<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Creating<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CloudManager {
    pub fn builder(transport: Arc<dyn Transport>, launcher: Arc<dyn HostLauncher>) -> CloudManagerBuilder {
        CloudManagerBuilder::new(transport, launcher)
    }

    pub(crate) fn assemble(parts: ManagerParts) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                client_id: parts.client_id,
                config: parts.config,
                peer: parts.peer,
                pool: parts.pool,
                policy: parts.policy,
                discovery: parts.discovery,
                sink: parts.sink,
                references: parts.references,
                callback_queue: parts.callback_queue,
                registry: Mutex::new(Registry::default()),
                creating: AtomicUsize::new(0),
                timers: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> Codec {
        self.inner.config.codec
    }

    pub fn pool(&self) -> &HostPool {
        &self.inner.pool
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() { Err(Error::Stopped) } else { Ok(()) }
    }

    // --- creation ---

    /// Places and constructs an instance of `class`, choosing the
    /// constructor whose parameter types match `A`.
    pub async fn create_object<A: Args>(&self, class: &str, args: A) -> Result<ClientHandle> {
        let bytes = self.codec().encode(&args)?;
        self.create_object_raw(class, A::type_names(), bytes).await
    }

    pub async fn create_object_raw(&self, class: &str, param_types: Vec<String>, args: Vec<u8>) -> Result<ClientHandle> {
        self.ensure_running()?;
        let _creating = Creating::enter(&self.inner.creating);
        let descriptor = ObjectDescriptor {
            class: class.to_string(),
            param_types,
        };

        let host = {
            let _placement = self.inner.pool.placement_lock().await;
            let selected = self.inner.policy.select_host(&descriptor, &self.inner.pool).await?;
            let Some(host) = selected.filter(|h| h.is_placeable()) else {
                return Err(Error::NoHostSelected {
                    class: class.to_string(),
                });
            };
            host.reserve(class);
            host
        };

        match self.construct_on(&host, descriptor, args).await {
            Ok(object_id) => {
                {
                    let mut registry = self.inner.registry.lock();
                    host.commit(object_id, class);
                    registry.live.insert(
                        object_id,
                        Entry {
                            host: host.clone(),
                            class: class.to_string(),
                            lifecycle: Lifecycle::Live,
                            gate: Arc::new(RwLock::new(())),
                        },
                    );
                }
                self.inner.sink.emit(Event::ObjectCreated {
                    object: object_id,
                    class: class.to_string(),
                    host: host.id(),
                });
                info!(object_id = %object_id, class, host_id = %host.id(), "object created");
                Ok(ClientHandle {
                    id: object_id,
                    class: class.to_string(),
                    host: host.id(),
                })
            }
            Err(e) => {
                host.cancel_reservation(class);
                warn!(class, host_id = %host.id(), error = %e, "object creation failed");
                self.consider_scale_down(&host).await;
                Err(e)
            }
        }
    }

    async fn construct_on(&self, host: &Host, descriptor: ObjectDescriptor, args: Vec<u8>) -> Result<ObjectId> {
        host.wait_until_running(self.inner.config.host_startup_timeout()).await?;
        let class = descriptor.class;
        let request = Request::CreateObject {
            class: class.clone(),
            param_types: descriptor.param_types,
            args,
        };
        match self.call(host, "create", request).await? {
            Response::Created { object_id } => Ok(object_id),
            Response::Failed(fault) => Err(Error::RemoteConstruction { class, fault }),
            other => Err(Error::UnexpectedResponse {
                operation: "create",
                received: other.kind(),
            }),
        }
    }

    /// Number of `create_object` calls not yet finished.
    pub fn creations_in_flight(&self) -> usize {
        self.inner.creating.load(Ordering::Acquire)
    }

    // --- invocation and fields ---

    pub async fn invoke<A, R>(&self, id: ObjectId, method: &str, args: A) -> Result<R>
    where
        A: Args,
        R: DeserializeOwned,
    {
        let bytes = self.codec().encode(&args)?;
        let value = self.invoke_raw(id, method, A::type_names(), bytes).await?;
        Ok(self.codec().decode(&value)?)
    }

    pub async fn invoke_raw(&self, id: ObjectId, method: &str, param_types: Vec<String>, args: Vec<u8>) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let (_gate, host) = self.enter(id).await?;
        let request = Request::StartInvocation {
            object_id: id,
            method: method.to_string(),
            param_types,
            args,
        };
        match self.call(&host, "invoke", request).await? {
            Response::Value(bytes) => Ok(bytes),
            Response::Failed(fault) => Err(Error::RemoteInvocation {
                object_id: id,
                operation: method.to_string(),
                fault,
            }),
            other => Err(Error::UnexpectedResponse {
                operation: "invoke",
                received: other.kind(),
            }),
        }
    }

    pub async fn get_field<V: DeserializeOwned>(&self, id: ObjectId, field: &str) -> Result<V> {
        let bytes = self.get_field_raw(id, field).await?;
        Ok(self.codec().decode(&bytes)?)
    }

    pub async fn get_field_raw(&self, id: ObjectId, field: &str) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let (_gate, host) = self.enter(id).await?;
        let request = Request::GetFieldValue {
            object_id: id,
            field: field.to_string(),
        };
        match self.call(&host, "get_field", request).await? {
            Response::Value(bytes) => Ok(bytes),
            Response::Failed(fault) => Err(Error::RemoteInvocation {
                object_id: id,
                operation: format!("get {}", field),
                fault,
            }),
            other => Err(Error::UnexpectedResponse {
                operation: "get_field",
                received: other.kind(),
            }),
        }
    }

    pub async fn set_field<V: Serialize + ?Sized>(&self, id: ObjectId, field: &str, value: &V) -> Result<()> {
        let bytes = self.codec().encode(value)?;
        self.set_field_raw(id, field, bytes).await
    }

    pub async fn set_field_raw(&self, id: ObjectId, field: &str, value: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        let (_gate, host) = self.enter(id).await?;
        let request = Request::SetFieldValue {
            object_id: id,
            field: field.to_string(),
            value,
        };
        match self.call(&host, "set_field", request).await? {
            Response::Ack => Ok(()),
            Response::Failed(fault) => Err(Error::RemoteInvocation {
                object_id: id,
                operation: format!("set {}", field),
                fault,
            }),
            other => Err(Error::UnexpectedResponse {
                operation: "set_field",
                received: other.kind(),
            }),
        }
    }

    // --- destroy and keep-alive ---

    /// Destroys the object on its host. Repeating it, or destroying an id
    /// this manager never created, is a no-op.
    pub async fn destroy(&self, id: ObjectId) -> Result<()> {
        let gate = {
            let registry = self.inner.registry.lock();
            if registry.destroyed.contains(&id) {
                return Ok(());
            }
            match registry.live.get(&id) {
                Some(entry) => entry.gate.clone(),
                None => {
                    debug!(object_id = %id, "destroy of unknown object ignored");
                    return Ok(());
                }
            }
        };
        let gate = gate.read_owned().await;

        let host = {
            let registry = self.inner.registry.lock();
            match registry.live.get(&id) {
                Some(entry) => entry.host.clone(),
                None => return Ok(()),
            }
        };

        match self.call(&host, "destroy", Request::DeleteObject { object_id: id }).await? {
            Response::Ack => {}
            Response::Failed(fault) if fault.kind == FaultKind::NoSuchObject => {
                debug!(object_id = %id, host_id = %host.id(), "object already gone on host");
            }
            Response::Failed(fault) => {
                return Err(Error::RemoteInvocation {
                    object_id: id,
                    operation: "destroy".into(),
                    fault,
                });
            }
            other => {
                return Err(Error::UnexpectedResponse {
                    operation: "destroy",
                    received: other.kind(),
                });
            }
        }

        {
            let mut registry = self.inner.registry.lock();
            if registry.live.remove(&id).is_some() {
                host.detach(&id);
            }
            registry.destroyed.insert(id);
        }
        drop(gate);

        self.inner.sink.emit(Event::ObjectDestroyed {
            object: id,
            host: host.id(),
        });
        info!(object_id = %id, host_id = %host.id(), "object destroyed");
        self.consider_scale_down(&host).await;
        Ok(())
    }

    /// Tells the object's host it is still in use. One-way.
    pub async fn keep_alive(&self, id: ObjectId) -> Result<()> {
        self.ensure_running()?;
        let (host, _) = self.lookup(id)?;
        let address = self.address_of(&host)?;
        self.inner
            .peer
            .send(
                &Destination::Queue(address),
                Some(self.inner.client_id),
                Request::KeepAlive { object_id: id },
            )
            .await?;
        Ok(())
    }

    /// One keep-alive for every live object.
    pub async fn send_keep_alives(&self) {
        let targets: Vec<(ObjectId, Arc<Host>)> = {
            let registry = self.inner.registry.lock();
            registry
                .live
                .iter()
                .filter(|(_, e)| e.lifecycle == Lifecycle::Live)
                .map(|(id, e)| (*id, e.host.clone()))
                .collect()
        };
        for (id, host) in targets {
            let Some(address) = host.address() else {
                continue;
            };
            let request = Request::KeepAlive { object_id: id };
            if let Err(e) = self
                .inner
                .peer
                .send(&Destination::Queue(address), Some(self.inner.client_id), request)
                .await
            {
                warn!(object_id = %id, error = %e, "keep-alive failed");
            }
        }
    }

    // --- scaling ---

    /// Offers every empty owned host to the policy.
    pub async fn scale_down_idle_hosts(&self) {
        for host in self.inner.pool.hosts() {
            if host.object_count() == 0 {
                self.consider_scale_down(&host).await;
            }
        }
    }

    async fn consider_scale_down(&self, host: &Arc<Host>) {
        if host.is_static() {
            return;
        }
        match host.state() {
            HostState::Draining => {
                self.inner.pool.retire_if_drained(host).await;
            }
            HostState::Running => {
                let drained = {
                    let _placement = self.inner.pool.placement_lock().await;
                    if host.object_count() != 0 || host.state() != HostState::Running {
                        return;
                    }
                    if !self.inner.policy.scale_down(host, &self.inner.pool).await {
                        return;
                    }
                    self.inner.pool.drain(host.id()).is_ok()
                };
                if drained {
                    self.inner.pool.retire_if_drained(host).await;
                }
            }
            HostState::Starting | HostState::Terminated => {}
        }
    }

    // --- migration ---

    /// Moves the object to `target`, keeping its id. On failure the object
    /// stays live on whichever host the error names.
    pub async fn migrate(&self, id: ObjectId, target: HostId) -> Result<()> {
        self.ensure_running()?;
        let (_, gate) = self.lookup(id)?;
        let _exclusive = gate.write_owned().await;

        let (source, class) = {
            let mut registry = self.inner.registry.lock();
            if registry.destroyed.contains(&id) {
                return Err(Error::DestroyedObject(id));
            }
            let entry = registry.live.get_mut(&id).ok_or(Error::UnknownObject(id))?;
            if entry.host.id() == target {
                return Ok(());
            }
            entry.lifecycle = Lifecycle::Migrating;
            (entry.host.clone(), entry.class.clone())
        };

        let result = self.relocate(id, &source, target, &class).await;

        if let Some(entry) = self.inner.registry.lock().live.get_mut(&id) {
            entry.lifecycle = Lifecycle::Live;
        }
        result
    }

    /// Runs [`Self::migrate`] in the background.
    pub fn migrate_async(&self, id: ObjectId, target: HostId) -> JoinHandle<Result<()>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.migrate(id, target).await })
    }

    async fn relocate(&self, id: ObjectId, source: &Arc<Host>, target_id: HostId, class: &str) -> Result<()> {
        let fail = |stage: MigrationStage, reason: String| {
            warn!(object_id = %id, %stage, reason = %reason, "migration failed");
            self.inner.sink.emit(Event::MigrationFailed {
                object: id,
                stage,
                reason: reason.clone(),
            });
            Error::Migration {
                object_id: id,
                stage,
                reason,
            }
        };

        let Some(target) = self.inner.pool.host(target_id) else {
            return Err(fail(MigrationStage::Prepare, format!("{} is not in the pool", target_id)));
        };
        {
            let _placement = self.inner.pool.placement_lock().await;
            if !target.is_placeable() {
                return Err(fail(MigrationStage::Prepare, format!("{} is {}", target_id, target.state())));
            }
            target.reserve(class);
        }
        self.inner.sink.emit(Event::MigrationStarted {
            object: id,
            source: source.id(),
            target: target_id,
        });
        info!(object_id = %id, source = %source.id(), target = %target_id, "migration started");

        if let Err(e) = target.wait_until_running(self.inner.config.host_startup_timeout()).await {
            target.cancel_reservation(class);
            return Err(fail(MigrationStage::Prepare, e.to_string()));
        }

        let serialized = self
            .call(source, "serialize_for_migration", Request::SerializeForMigration { object_id: id })
            .await;
        let record = match serialized {
            Ok(Response::Migrated { class: class_name, state }) => MigrationRecord {
                object_id: id,
                source: source.id(),
                target: target_id,
                class: class_name,
                state,
            },
            other => {
                target.cancel_reservation(class);
                let untouched = matches!(
                    &other,
                    Ok(Response::Failed(fault)) if matches!(fault.kind, FaultKind::NotMigratable | FaultKind::NoSuchObject)
                );
                if !untouched {
                    self.abort_on_source(id, source).await;
                }
                return Err(fail(MigrationStage::Serialize, describe(other)));
            }
        };
        debug!(object_id = %id, bytes = record.state.len(), "object state captured");

        let deployed = self
            .call(
                &target,
                "deploy_migrated",
                Request::DeployMigrated {
                    object_id: record.object_id,
                    class: record.class,
                    state: record.state,
                },
            )
            .await;
        match deployed {
            Ok(Response::Ack) => {}
            other => {
                target.cancel_reservation(class);
                if matches!(other, Err(Error::RemoteTimeout { .. })) {
                    self.discard_on_target(id, &target).await;
                }
                self.abort_on_source(id, source).await;
                return Err(fail(MigrationStage::Deploy, describe(other)));
            }
        }

        {
            let mut registry = self.inner.registry.lock();
            if let Some(entry) = registry.live.get_mut(&id) {
                entry.host = target.clone();
            }
            source.detach(&id);
            target.commit(id, class);
        }

        let removed = self
            .call(source, "remove_migrated", Request::RemoveMigrated { object_id: id })
            .await;
        self.inner.sink.emit(Event::MigrationFinished {
            object: id,
            source: record.source,
            target: record.target,
        });
        info!(object_id = %id, source = %record.source, target = %record.target, "migration finished");

        let result = match removed {
            Ok(Response::Ack) => Ok(()),
            other => Err(fail(
                MigrationStage::Remove,
                format!("{}; object is live on {}", describe(other), target_id),
            )),
        };
        self.consider_scale_down(source).await;
        result
    }

    async fn abort_on_source(&self, id: ObjectId, source: &Host) {
        match self
            .call(source, "abort_migration", Request::AbortMigration { object_id: id })
            .await
        {
            Ok(Response::Ack) => debug!(object_id = %id, host_id = %source.id(), "source copy restored"),
            other => warn!(object_id = %id, host_id = %source.id(), reason = %describe(other), "abort on source failed"),
        }
    }

    async fn discard_on_target(&self, id: ObjectId, target: &Host) {
        if let Ok(Response::Ack) = self
            .call(target, "remove_migrated", Request::RemoveMigrated { object_id: id })
            .await
        {
            debug!(object_id = %id, host_id = %target.id(), "late deploy discarded");
        }
    }

    // --- discovery ---

    /// Looks for an already running host on the discovery topic and adds it
    /// to the pool as a static host.
    pub async fn discover(&self, timeout: Duration) -> Result<Option<Arc<Host>>> {
        self.ensure_running()?;
        let found = self
            .inner
            .discovery
            .discover(timeout)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(found.map(|address| self.inner.pool.register_static(address)))
    }

    // --- queries ---

    pub fn host_of(&self, id: ObjectId) -> Result<HostId> {
        self.lookup(id).map(|(host, _)| host.id())
    }

    /// `None` for ids this manager never registered.
    pub fn object_state(&self, id: ObjectId) -> Option<Lifecycle> {
        let registry = self.inner.registry.lock();
        if registry.destroyed.contains(&id) {
            return Some(Lifecycle::Destroyed);
        }
        registry.live.get(&id).map(|e| e.lifecycle)
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.inner.pool.hosts()
    }

    pub fn hosts_count(&self) -> usize {
        self.inner.pool.hosts_count()
    }

    pub fn count_cloud_objects(&self) -> usize {
        self.inner.pool.count_cloud_objects()
    }

    pub fn cloud_objects(&self) -> Vec<ObjectId> {
        self.inner.pool.cloud_objects()
    }

    // --- shutdown ---

    /// Destroys every object, shuts down owned hosts and closes the bus
    /// connection. Idempotent.
    /// Hands out `target` by reference. Hosts that receive the reference as an
    /// argument call back into it until it is released.
    pub fn export(&self, target: impl CallbackTarget + 'static) -> Reference {
        let reference = self.inner.references.export(&self.inner.callback_queue, Arc::new(target));
        debug!(reference = %reference, "exported");
        reference
    }

    pub fn release(&self, reference: &Reference) -> bool {
        self.inner.references.release(&reference.id)
    }

    pub fn exported_count(&self) -> usize {
        self.inner.references.len()
    }

    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for timer in self.inner.timers.lock().drain(..) {
            timer.abort();
        }

        let live: Vec<(ObjectId, Arc<Host>)> = {
            let mut registry = self.inner.registry.lock();
            let live: Vec<(ObjectId, Arc<Host>)> = registry.live.drain().map(|(id, e)| (id, e.host)).collect();
            registry.destroyed.extend(live.iter().map(|(id, _)| *id));
            live
        };
        for (id, host) in live.iter().filter(|(_, h)| h.is_static()) {
            if let Err(e) = self.call(host, "destroy", Request::DeleteObject { object_id: *id }).await {
                warn!(object_id = %id, error = %e, "destroy on static host failed during stop");
            }
        }

        for host in self.inner.pool.hosts() {
            if !host.is_static() {
                if let Some(address) = host.address() {
                    if let Err(e) = self
                        .inner
                        .peer
                        .send(&Destination::Queue(address), Some(self.inner.client_id), Request::Shutdown)
                        .await
                    {
                        warn!(host_id = %host.id(), error = %e, "shutdown request failed during stop");
                    }
                }
            }
            if let Err(e) = self.inner.pool.force_shutdown_host(host.id()).await {
                warn!(host_id = %host.id(), error = %e, "host shutdown failed during stop");
            }
        }

        self.inner.references.clear();
        self.inner.peer.close();
        info!(client_id = %self.inner.client_id, destroyed = live.len(), "cloud manager stopped");
    }

    pub(crate) fn spawn_timers(&self) {
        let mut timers = self.inner.timers.lock();
        if let Some(period) = self.inner.config.scale_down_interval() {
            timers.push(self.spawn_timer(period, |manager| async move { manager.scale_down_idle_hosts().await }));
        }
        if let Some(period) = self.inner.config.keep_alive_interval() {
            timers.push(self.spawn_timer(period, |manager| async move { manager.send_keep_alives().await }));
        }
    }

    fn spawn_timer<F, Fut>(&self, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(CloudManager) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tick(CloudManager { inner }).await;
            }
        })
    }

    // --- plumbing ---

    fn lookup(&self, id: ObjectId) -> Result<(Arc<Host>, Arc<RwLock<()>>)> {
        let registry = self.inner.registry.lock();
        if registry.destroyed.contains(&id) {
            return Err(Error::DestroyedObject(id));
        }
        registry
            .live
            .get(&id)
            .map(|e| (e.host.clone(), e.gate.clone()))
            .ok_or(Error::UnknownObject(id))
    }

    /// Takes the object's gate shared and resolves its current host.
    async fn enter(&self, id: ObjectId) -> Result<(OwnedRwLockReadGuard<()>, Arc<Host>)> {
        let (_, gate) = self.lookup(id)?;
        let guard = gate.read_owned().await;
        let (host, _) = self.lookup(id)?;
        Ok((guard, host))
    }

    fn address_of(&self, host: &Host) -> Result<String> {
        host.address().ok_or_else(|| Error::HostUnavailable {
            host: host.id(),
            reason: format!("{} and has no address", host.state()),
        })
    }

    async fn call(&self, host: &Host, operation: &'static str, request: Request) -> Result<Response> {
        let address = self.address_of(host)?;
        host.touch();
        self.inner
            .peer
            .request(
                &Destination::Queue(address),
                Some(self.inner.client_id),
                request,
                self.inner.config.request_timeout(),
            )
            .await
            .map_err(|e| match e {
                peer::Error::Timeout(timeout) => Error::RemoteTimeout { operation, timeout },
                other => Error::from(other),
            })
    }
}

fn describe(outcome: Result<Response>) -> String {
    match outcome {
        Ok(Response::Failed(fault)) => fault.to_string(),
        Ok(other) => format!("unexpected {} response", other.kind()),
        Err(e) => e.to_string(),
    }
}

impl std::fmt::Debug for CloudManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudManager")
            .field("client_id", &self.inner.client_id)
            .field("hosts", &self.hosts_count())
            .field("objects", &self.count_cloud_objects())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
