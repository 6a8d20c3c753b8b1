//! Framework-managed handle given to every cloud object that asks for one.
//!
//! A class opts in with [`crate::ledger::ClassBuilder::context_field`]. The host
//! fills the field after construction and after every migration, and clears it
//! before migration state is serialized.
//!
//! On a host the context also carries the route back to clients, so an object
//! handed a [`Reference`] can call into it with [`ObjectContext::call_back`].

use std::fmt;
use std::sync::Arc;

use cloudrpc::Fault;
use cloudrpc::FaultKind;
use cloudrpc::ObjectId;
use cloudrpc::Reference;
use serde::de::DeserializeOwned;

use crate::ledger::Args;
use crate::reference;
use crate::reference::CallbackRouter;
use crate::telemetry::Event;
use crate::telemetry::EventSink;

#[derive(Clone)]
pub struct ObjectContext {
    id: ObjectId,
    sink: Arc<dyn EventSink>,
    callbacks: Option<Arc<dyn CallbackRouter>>,
}

impl ObjectContext {
    pub fn new(id: ObjectId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id,
            sink,
            callbacks: None,
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn CallbackRouter>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Publishes a custom event tagged with this object's id.
    pub fn emit(&self, name: impl Into<String>, payload: impl Into<String>) {
        self.sink.emit(Event::Custom {
            object: self.id,
            name: name.into(),
            payload: payload.into(),
        });
    }

    /// Calls `method` on the object behind `reference` and waits for its
    /// owner to answer. Only valid from user code running on a host.
    pub fn call_back<A, R>(&self, reference: &Reference, method: &str, args: A) -> Result<R, Fault>
    where
        A: Args,
        R: DeserializeOwned,
    {
        let Some(router) = &self.callbacks else {
            return Err(Fault::new(
                FaultKind::NoSuchReference,
                format!("{} cannot be reached from here", reference),
            ));
        };
        reference::call_back(router.as_ref(), reference, method, args)
    }
}

impl fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectContext").field("id", &self.id).finish_non_exhaustive()
    }
}
