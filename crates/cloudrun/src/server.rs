//! # Host Server
//!
//! The remote request dispatcher. One `HostServer` runs per host: it consumes
//! the host's request queue, executes each message against the local object
//! table, and answers on the sender's reply queue with the same correlation id.
//!
//! ## Architecture
//!
//! - Every message gets its own task, optionally bounded by a semaphore, so a
//!   slow invocation never holds up unrelated requests.
//! - User code (constructors, methods, hooks) and field access run on the
//!   blocking pool behind `catch_unwind`; a panic becomes a fault in the
//!   response. Nothing on the async workers waits for an instance lock.
//! - Classes are resolved through a [`ClassProvider`] and cached per client.
//!   A client's cache is dropped once none of its objects remain.
//! - With a keep-alive interval configured, a sweep reclaims idle objects
//!   nobody has touched for `reclaim_after_missed_keep_alives` intervals.
//!   Busy objects are never reclaimed.
//!
//! ## Invariants
//!
//! - Every request that is not one-way gets exactly one response, failures
//!   included.
//! - Undecodable messages and stray responses are logged and dropped.

use std::collections::HashMap;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use cloudrpc::ClientId;
use cloudrpc::Codec;
use cloudrpc::Envelope;
use cloudrpc::Fault;
use cloudrpc::FaultKind;
use cloudrpc::ObjectId;
use cloudrpc::Request;
use cloudrpc::Response;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::HostConfig;
use crate::context::ObjectContext;
use crate::instance::ObjectState;
use crate::instance::RemoteObject;
use crate::instance::panic_message;
use crate::ledger::ClassDef;
use crate::ledger::ClassProvider;
use crate::migration;
use crate::peer;
use crate::peer::Peer;
use crate::reference::CallbackRouter;
use crate::reference::PeerCallbacks;
use crate::telemetry::Event;
use crate::telemetry::EventSink;
use crate::transport::Destination;
use crate::transport::Transport;
use crate::transport::discovery_topic;

/// How long a host remembers a migration it was told to discard before the
/// deploy itself arrived.
const DISCARD_MEMORY: Duration = Duration::from_secs(60);

#[derive(Default)]
struct ClassScope {
    classes: HashMap<String, Arc<ClassDef>>,
    residents: usize,
}

struct ServerInner {
    address: String,
    config: HostConfig,
    peer: Arc<Peer>,
    callbacks: Arc<dyn CallbackRouter>,
    provider: Arc<dyn ClassProvider>,
    sink: Arc<dyn EventSink>,
    objects: DashMap<ObjectId, Arc<RemoteObject>>,
    scopes: DashMap<ClientId, ClassScope>,
    /// Ids named by a `RemoveMigrated` that found nothing here.
    discarded: DashMap<ObjectId, Instant>,
    limit: Option<Arc<Semaphore>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to a running host server. Cloning shares the server.
#[derive(Clone)]
pub struct HostServer {
    inner: Arc<ServerInner>,
}

impl HostServer {
    /// Starts serving `address` and the discovery topic of the namespace.
    pub async fn start(
        address: impl Into<String>,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn ClassProvider>,
        config: HostConfig,
        sink: Arc<dyn EventSink>,
    ) -> peer::Result<Self> {
        let address = address.into();
        let reply_queue = format!("{}.replies", address);
        let peer = Arc::new(Peer::connect(address.clone(), transport, config.codec, reply_queue).await?);
        let callbacks = Arc::new(PeerCallbacks::new(peer.clone(), config.callback_timeout(), Handle::current()));
        let limit = config.max_concurrent_requests.map(|n| Arc::new(Semaphore::new(n)));

        let inner = Arc::new(ServerInner {
            address: address.clone(),
            peer,
            callbacks,
            provider,
            sink,
            objects: DashMap::new(),
            scopes: DashMap::new(),
            discarded: DashMap::new(),
            limit,
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
            config,
        });

        let requests = inner.clone();
        inner
            .peer
            .listen(
                Destination::Queue(address.clone()),
                |envelope| envelope.as_request().is_some(),
                move |envelope| {
                    let inner = requests.clone();
                    async move { inner.dispatch(envelope).await }
                },
            )
            .await?;

        let probes = inner.clone();
        inner
            .peer
            .listen(
                Destination::Topic(discovery_topic(&inner.config.namespace)),
                |envelope| matches!(envelope.as_request(), Some(Request::Probe)),
                move |envelope| {
                    let inner = probes.clone();
                    async move { inner.dispatch(envelope).await }
                },
            )
            .await?;

        if let Some(after) = inner.config.reclaim_after() {
            let period = after / inner.config.reclaim_after_missed_keep_alives.max(1);
            let weak = Arc::downgrade(&inner);
            *inner.sweeper.lock() = Some(tokio::spawn(sweep(weak, period)));
        }

        info!(address = %address, codec = inner.config.codec.name(), "host server started");
        Ok(Self { inner })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn objects(&self) -> Vec<ObjectId> {
        self.inner.objects.iter().map(|e| *e.key()).collect()
    }

    pub fn object_state(&self, id: &ObjectId) -> Option<ObjectState> {
        self.inner.objects.get(id).map(|o| o.state())
    }

    /// Number of clients with a live class cache.
    pub fn scope_count(&self) -> usize {
        self.inner.scopes.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops listening and destroys every resident object. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl ServerInner {
    fn codec(&self) -> Codec {
        self.config.codec
    }

    fn context_for(&self, id: ObjectId) -> ObjectContext {
        ObjectContext::new(id, self.sink.clone()).with_callbacks(self.callbacks.clone())
    }

    async fn dispatch(self: Arc<Self>, envelope: Envelope) {
        let Some(request) = envelope.as_request().cloned() else {
            warn!(address = %self.address, "stray response dropped");
            return;
        };
        if self.stopped.load(Ordering::Acquire) {
            debug!(address = %self.address, kind = request.kind(), "server stopped, request ignored");
            return;
        }

        let _permit = match &self.limit {
            Some(limit) => match limit.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        let kind = request.kind();
        debug!(address = %self.address, correlation_id = %envelope.correlation_id, kind, "request");

        let response = match request {
            Request::KeepAlive { object_id } => {
                self.keep_alive(object_id);
                return;
            }
            Request::Shutdown => {
                info!(address = %self.address, "shutdown requested");
                self.shutdown();
                return;
            }
            request => self.clone().execute(envelope.client_id, request).await,
        };

        let Some(reply_to) = envelope.reply_to else {
            debug!(address = %self.address, kind, "no reply address, response dropped");
            return;
        };
        if let Err(e) = self.peer.respond(&reply_to, envelope.correlation_id, response).await {
            warn!(address = %self.address, kind, error = %e, "failed to send response");
        }
    }

    async fn execute(self: Arc<Self>, client: Option<ClientId>, request: Request) -> Response {
        let result = match request {
            Request::CreateObject {
                class,
                param_types,
                args,
            } => match client {
                Some(client) => self.blocking(move |this| this.construct(client, &class, &param_types, &args)).await,
                None => Err(Fault::bad_arguments("create without client id")),
            },
            Request::StartInvocation {
                object_id,
                method,
                param_types,
                args,
            } => self.invoke(object_id, method, param_types, args).await,
            Request::GetFieldValue { object_id, field } => {
                self.blocking(move |this| this.get_field(object_id, &field)).await
            }
            Request::SetFieldValue {
                object_id,
                field,
                value,
            } => self.blocking(move |this| this.set_field(object_id, &field, &value)).await,
            Request::DeleteObject { object_id } => self.delete(object_id),
            Request::SerializeForMigration { object_id } => {
                self.blocking(move |this| this.serialize_for_migration(object_id)).await
            }
            Request::DeployMigrated {
                object_id,
                class,
                state,
            } => match client {
                Some(client) => self.blocking(move |this| this.deploy_migrated(client, object_id, &class, &state)).await,
                None => Err(Fault::bad_arguments("deploy without client id")),
            },
            Request::RemoveMigrated { object_id } => self.remove_migrated(object_id),
            Request::AbortMigration { object_id } => self.blocking(move |this| this.abort_migration(object_id)).await,
            Request::Probe => Ok(Response::ProbeReply {
                address: self.address.clone(),
            }),
            Request::InvokeCallback { .. } => Err(Fault::bad_arguments("hosts do not serve callbacks")),
            Request::KeepAlive { .. } | Request::Shutdown => Ok(Response::Ack),
        };
        if let Err(fault) = &result {
            debug!(address = %self.address, fault = %fault, "request failed");
        }
        Response::from(result)
    }

    /// Runs user code, and anything that may wait on an instance lock, off
    /// the async workers.
    async fn blocking<F>(self: &Arc<Self>, f: F) -> Result<Response, Fault>
    where
        F: FnOnce(&ServerInner) -> Result<Response, Fault> + Send + 'static,
    {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || panic::catch_unwind(AssertUnwindSafe(|| f(&*this)))).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(Fault::new(FaultKind::Panicked, panic_message(&*payload))),
            Err(e) => Err(Fault::new(FaultKind::Panicked, e.to_string())),
        }
    }

    fn lookup(&self, id: ObjectId) -> Result<Arc<RemoteObject>, Fault> {
        self.objects
            .get(&id)
            .map(|o| o.value().clone())
            .ok_or_else(|| Fault::new(FaultKind::NoSuchObject, id.to_string()))
    }

    fn resolve(&self, client: ClientId, name: &str) -> Result<Arc<ClassDef>, Fault> {
        if let Some(class) = self.scopes.get(&client).and_then(|s| s.classes.get(name).cloned()) {
            return Ok(class);
        }
        let class = self
            .provider
            .fetch(&client, name)
            .map_err(|e| Fault::new(FaultKind::NoSuchClass, e.to_string()))?;
        self.scopes
            .entry(client)
            .or_default()
            .classes
            .insert(name.to_string(), class.clone());
        Ok(class)
    }

    fn admit(&self, object: RemoteObject) {
        let id = object.id();
        self.scopes.entry(object.client()).or_default().residents += 1;
        self.objects.insert(id, Arc::new(object));
    }

    /// Drops a client's class cache once nothing of it is resident.
    fn release_scope(&self, client: ClientId, resident: bool) {
        if resident {
            if let Some(mut scope) = self.scopes.get_mut(&client) {
                scope.residents = scope.residents.saturating_sub(1);
            }
        }
        if self.scopes.remove_if(&client, |_, scope| scope.residents == 0).is_some() {
            debug!(address = %self.address, client = %client, "class scope dropped");
        }
    }

    fn construct(&self, client: ClientId, class_name: &str, param_types: &[String], args: &[u8]) -> Result<Response, Fault> {
        let result = self.resolve(client, class_name).and_then(|class| {
            let mut instance = class.construct(param_types, args, self.codec())?;
            let id = ObjectId::new();
            class.inject(instance.as_mut(), id, &self.context_for(id))?;
            Ok((id, RemoteObject::new(id, client, class, instance)))
        });
        match result {
            Ok((id, object)) => {
                self.admit(object);
                debug!(address = %self.address, object_id = %id, class = class_name, "object constructed");
                Ok(Response::Created { object_id: id })
            }
            Err(fault) => {
                self.release_scope(client, false);
                Err(fault)
            }
        }
    }

    async fn invoke(
        self: &Arc<Self>,
        id: ObjectId,
        method: String,
        param_types: Vec<String>,
        args: Vec<u8>,
    ) -> Result<Response, Fault> {
        let object = self.lookup(id)?;
        self.sink.emit(Event::InvocationStarted {
            object: id,
            method: method.clone(),
        });
        let started = Instant::now();
        let codec = self.codec();
        let call_method = method.clone();
        let result = self
            .blocking(move |_| {
                let _busy = object.begin();
                object
                    .with_instance(|class, instance| class.invoke(instance, &call_method, &param_types, &args, codec))
                    .map(Response::Value)
            })
            .await;
        self.sink.emit(Event::InvocationFinished {
            object: id,
            method,
            ok: result.is_ok(),
            elapsed: started.elapsed(),
        });
        result
    }

    fn get_field(&self, id: ObjectId, field: &str) -> Result<Response, Fault> {
        let object = self.lookup(id)?;
        object.touch();
        object
            .with_instance(|class, instance| class.read_field(instance, field, self.codec()))
            .map(Response::Value)
    }

    fn set_field(&self, id: ObjectId, field: &str, value: &[u8]) -> Result<Response, Fault> {
        let object = self.lookup(id)?;
        object.touch();
        object
            .with_instance(|class, instance| class.write_field(instance, field, value, self.codec()))
            .map(|_| Response::Ack)
    }

    fn delete(&self, id: ObjectId) -> Result<Response, Fault> {
        self.remove(id)?;
        debug!(address = %self.address, object_id = %id, "object deleted");
        Ok(Response::Ack)
    }

    fn remove(&self, id: ObjectId) -> Result<Arc<RemoteObject>, Fault> {
        let (_, object) = self
            .objects
            .remove(&id)
            .ok_or_else(|| Fault::new(FaultKind::NoSuchObject, id.to_string()))?;
        object.mark_destroyed();
        self.release_scope(object.client(), true);
        Ok(object)
    }

    fn keep_alive(&self, id: ObjectId) {
        match self.objects.get(&id) {
            Some(object) => object.touch(),
            None => debug!(address = %self.address, object_id = %id, "keep-alive for unknown object"),
        }
    }

    fn serialize_for_migration(&self, id: ObjectId) -> Result<Response, Fault> {
        let object = self.lookup(id)?;
        let (class, state) = migration::serialize(&object, self.codec())?;
        debug!(address = %self.address, object_id = %id, bytes = state.len(), "object serialized for migration");
        Ok(Response::Migrated { class, state })
    }

    fn deploy_migrated(&self, client: ClientId, id: ObjectId, class_name: &str, state: &[u8]) -> Result<Response, Fault> {
        if self.objects.contains_key(&id) {
            return Err(Fault::new(FaultKind::Migration, format!("{} is already resident", id)));
        }
        let result = self.resolve(client, class_name).and_then(|class| {
            let instance = migration::deploy(&class, id, state, self.codec(), &self.context_for(id))?;
            Ok(RemoteObject::new(id, client, class, instance))
        });
        match result {
            Ok(object) => {
                self.admit(object);
                if self.take_discard(id) {
                    let _ = self.remove(id);
                    info!(address = %self.address, object_id = %id, "late deploy of a discarded migration dropped");
                    return Err(Fault::new(FaultKind::Migration, format!("{} was discarded before it arrived", id)));
                }
                debug!(address = %self.address, object_id = %id, class = class_name, "migrated object deployed");
                Ok(Response::Ack)
            }
            Err(fault) => {
                self.release_scope(client, false);
                Err(fault)
            }
        }
    }

    /// The discard is recorded before the removal is attempted, so a deploy
    /// racing with it either is removed here or finds the record after
    /// admitting itself.
    fn remove_migrated(&self, id: ObjectId) -> Result<Response, Fault> {
        self.discarded.retain(|_, at| at.elapsed() < DISCARD_MEMORY);
        self.discarded.insert(id, Instant::now());
        match self.remove(id) {
            Ok(_) => {
                self.discarded.remove(&id);
                Ok(Response::Ack)
            }
            Err(fault) => {
                debug!(address = %self.address, object_id = %id, "discard recorded ahead of its deploy");
                Err(fault)
            }
        }
    }

    fn take_discard(&self, id: ObjectId) -> bool {
        self.discarded
            .remove(&id)
            .is_some_and(|(_, at)| at.elapsed() < DISCARD_MEMORY)
    }

    fn abort_migration(&self, id: ObjectId) -> Result<Response, Fault> {
        let object = self.lookup(id)?;
        migration::abort(&object, &self.context_for(id))?;
        info!(address = %self.address, object_id = %id, "migration aborted, object restored");
        Ok(Response::Ack)
    }

    fn reclaim_idle(&self) {
        let Some(after) = self.config.reclaim_after() else {
            return;
        };
        let idle: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| o.state() == ObjectState::Idle && o.idle_for() > after)
            .map(|o| *o.key())
            .collect();
        for id in idle {
            if self.remove(id).is_ok() {
                info!(address = %self.address, object_id = %id, ?after, "idle object reclaimed");
                self.sink.emit(Event::ObjectReclaimed {
                    object: id,
                    address: self.address.clone(),
                });
            }
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.peer.close();
        let ids: Vec<ObjectId> = self.objects.iter().map(|o| *o.key()).collect();
        for id in &ids {
            let _ = self.remove(*id);
        }
        self.scopes.clear();
        info!(address = %self.address, destroyed = ids.len(), "host server stopped");
    }
}

async fn sweep(inner: Weak<ServerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.reclaim_idle();
    }
}
