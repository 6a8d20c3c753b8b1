//! # Telemetry
//!
//! The runtime pushes lifecycle events into an [`EventSink`] supplied by the
//! embedding application. Collection, aggregation and correlation of those
//! events happen outside the runtime.
//!
//! Diagnostics go through `tracing`; [`init_tracing`] installs a formatting
//! subscriber filtered by `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use cloudrpc::HostId;
use cloudrpc::ObjectId;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::migration::MigrationStage;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    HostStarting { host: HostId },
    HostStarted { host: HostId, address: String },
    HostLaunchFailed { host: HostId, reason: String },
    HostDraining { host: HostId },
    HostTerminated { host: HostId },
    ObjectCreated { object: ObjectId, class: String, host: HostId },
    ObjectDestroyed { object: ObjectId, host: HostId },
    /// A host dropped an object nobody kept alive.
    ObjectReclaimed { object: ObjectId, address: String },
    InvocationStarted { object: ObjectId, method: String },
    InvocationFinished { object: ObjectId, method: String, ok: bool, elapsed: Duration },
    MigrationStarted { object: ObjectId, source: HostId, target: HostId },
    MigrationFinished { object: ObjectId, source: HostId, target: HostId },
    MigrationFailed { object: ObjectId, stage: MigrationStage, reason: String },
    /// Emitted by object code through its [`crate::context::ObjectContext`].
    Custom { object: ObjectId, name: String, payload: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostStarting { .. } => "host_starting",
            Self::HostStarted { .. } => "host_started",
            Self::HostLaunchFailed { .. } => "host_launch_failed",
            Self::HostDraining { .. } => "host_draining",
            Self::HostTerminated { .. } => "host_terminated",
            Self::ObjectCreated { .. } => "object_created",
            Self::ObjectDestroyed { .. } => "object_destroyed",
            Self::ObjectReclaimed { .. } => "object_reclaimed",
            Self::InvocationStarted { .. } => "invocation_started",
            Self::InvocationFinished { .. } => "invocation_finished",
            Self::MigrationStarted { .. } => "migration_started",
            Self::MigrationFinished { .. } => "migration_finished",
            Self::MigrationFailed { .. } => "migration_failed",
            Self::Custom { .. } => "custom",
        }
    }
}

pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event);
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Logs every event at `info`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        info!(target: "cloudrun::events", event = event.name(), details = ?event);
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Forwards each event to several sinks.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Installs a fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Calling it again is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
