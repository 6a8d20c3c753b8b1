//! Host-side record of one resident cloud object.

use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use cloudrpc::ClientId;
use cloudrpc::Fault;
use cloudrpc::FaultKind;
use cloudrpc::ObjectId;
use parking_lot::Mutex;

use crate::ledger::ClassDef;
use crate::ledger::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Idle,
    /// At least one invocation is running.
    Busy,
    Destroyed,
}

pub struct RemoteObject {
    id: ObjectId,
    client: ClientId,
    class: Arc<ClassDef>,
    instance: Mutex<Instance>,
    inflight: AtomicUsize,
    destroyed: AtomicBool,
    last_touched: Mutex<Instant>,
}

/// Marks the object busy for as long as it lives.
pub struct BusyGuard<'a> {
    object: &'a RemoteObject,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.object.inflight.fetch_sub(1, Ordering::AcqRel);
        self.object.touch();
    }
}

impl RemoteObject {
    pub fn new(id: ObjectId, client: ClientId, class: Arc<ClassDef>, instance: Instance) -> Self {
        Self {
            id,
            client,
            class,
            instance: Mutex::new(instance),
            inflight: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn class(&self) -> &Arc<ClassDef> {
        &self.class
    }

    pub fn state(&self) -> ObjectState {
        if self.destroyed.load(Ordering::Acquire) {
            ObjectState::Destroyed
        } else if self.inflight.load(Ordering::Acquire) > 0 {
            ObjectState::Busy
        } else {
            ObjectState::Idle
        }
    }

    pub fn begin(&self) -> BusyGuard<'_> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        BusyGuard { object: self }
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_touched.lock().elapsed()
    }

    /// Runs `f` against the instance under its lock. Panics become
    /// [`FaultKind::Panicked`].
    pub fn with_instance<R>(
        &self,
        f: impl FnOnce(&ClassDef, &mut (dyn Any + Send)) -> Result<R, Fault>,
    ) -> Result<R, Fault> {
        let mut guard = self.instance.lock();
        let class: &ClassDef = &self.class;
        match panic::catch_unwind(AssertUnwindSafe(|| f(class, &mut **guard))) {
            Ok(result) => result,
            Err(payload) => Err(Fault::new(FaultKind::Panicked, panic_message(&*payload))),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
