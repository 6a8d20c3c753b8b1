//! # Objects passed by reference
//!
//! A client can hand a host a [`Reference`] instead of a value. The object
//! stays in the client's [`ReferenceTable`]; the host reaches it by sending
//! `InvokeCallback` to the queue named in the reference, and the client runs
//! the call on its blocking pool and answers like a host would.
//!
//! Callback targets are described the same way classes are: methods keyed by
//! `name(param types)`, arguments and results in the session codec.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cloudrpc::Codec;
use cloudrpc::Fault;
use cloudrpc::FaultKind;
use cloudrpc::Reference;
use cloudrpc::ReferenceId;
use cloudrpc::Request;
use cloudrpc::Response;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::debug;
use tracing::warn;

use crate::instance::panic_message;
use crate::ledger::Args;
use crate::ledger::decode;
use crate::ledger::encode;
use crate::ledger::signature;
use crate::peer;
use crate::peer::Peer;
use crate::transport::Destination;

/// Something a client exports so hosts can call back into it.
pub trait CallbackTarget: Send + Sync {
    fn class(&self) -> &str;

    fn call(&self, method: &str, param_types: &[String], args: &[u8], codec: Codec) -> Result<Vec<u8>, Fault>;
}

type Callable<T> = Arc<dyn Fn(&T, &[u8], Codec) -> Result<Vec<u8>, Fault> + Send + Sync>;

/// A value plus the methods hosts may call on it.
pub struct CallbackObject<T> {
    class: String,
    value: T,
    methods: HashMap<String, Callable<T>>,
}

impl<T: Send + Sync + 'static> CallbackObject<T> {
    pub fn new(value: T) -> Self {
        let class = type_name::<T>().rsplit("::").next().unwrap_or("object").to_string();
        Self {
            class,
            value,
            methods: HashMap::new(),
        }
    }

    pub fn method<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: Args,
        R: Serialize + 'static,
        F: Fn(&T, A) -> R + Send + Sync + 'static,
    {
        self.try_method(name, move |value: &T, args: A| Ok::<R, String>(f(value, args)))
    }

    pub fn try_method<A, R, E, F>(mut self, name: &str, f: F) -> Self
    where
        A: Args,
        R: Serialize + 'static,
        E: fmt::Display,
        F: Fn(&T, A) -> Result<R, E> + Send + Sync + 'static,
    {
        let callable: Callable<T> = Arc::new(move |value: &T, bytes: &[u8], codec: Codec| {
            let args: A = decode(codec, bytes, "callback arguments")?;
            let result = f(value, args).map_err(|e| Fault::raised(e.to_string()))?;
            encode(codec, &result)
        });
        self.methods.insert(signature(name, &A::type_names()), callable);
        self
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T: Send + Sync + 'static> CallbackTarget for CallbackObject<T> {
    fn class(&self) -> &str {
        &self.class
    }

    fn call(&self, method: &str, param_types: &[String], args: &[u8], codec: Codec) -> Result<Vec<u8>, Fault> {
        let key = signature(method, param_types);
        let callable = self.methods.get(&key).ok_or_else(|| {
            Fault::new(
                FaultKind::NoSuchMethod,
                format!("`{}` has no callback `{}`", self.class, key),
            )
        })?;
        callable(&self.value, args, codec)
    }
}

/// The objects a client has exported, by reference id.
#[derive(Default)]
pub struct ReferenceTable {
    entries: DashMap<ReferenceId, Arc<dyn CallbackTarget>>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `target` and returns the reference hosts will call through.
    pub fn export(&self, owner: &str, target: Arc<dyn CallbackTarget>) -> Reference {
        let reference = Reference {
            id: ReferenceId::new(),
            owner: owner.to_string(),
            class: target.class().to_string(),
        };
        self.entries.insert(reference.id, target);
        reference
    }

    /// Later callbacks through `id` fail with `NoSuchReference`.
    pub fn release(&self, id: &ReferenceId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Runs one callback. Blocks for as long as the target does.
    pub fn dispatch(
        &self,
        reference: ReferenceId,
        method: &str,
        param_types: &[String],
        args: &[u8],
        codec: Codec,
    ) -> Result<Vec<u8>, Fault> {
        let target = self
            .entries
            .get(&reference)
            .map(|e| e.value().clone())
            .ok_or_else(|| Fault::new(FaultKind::NoSuchReference, format!("{} is not exported", reference)))?;
        match panic::catch_unwind(AssertUnwindSafe(|| target.call(method, param_types, args, codec))) {
            Ok(result) => result,
            Err(payload) => Err(Fault::new(FaultKind::Panicked, panic_message(&*payload))),
        }
    }
}

impl fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTable").field("entries", &self.entries.len()).finish()
    }
}

/// How object code reaches the owner of a reference.
pub trait CallbackRouter: Send + Sync {
    /// Called from user code on the blocking pool; may block.
    fn call(&self, reference: &Reference, method: &str, param_types: Vec<String>, args: Vec<u8>) -> Result<Vec<u8>, Fault>;

    fn codec(&self) -> Codec;
}

/// Host-side router: forwards callbacks over the host's peer.
pub struct PeerCallbacks {
    peer: Arc<Peer>,
    timeout: Duration,
    runtime: Handle,
}

impl PeerCallbacks {
    pub fn new(peer: Arc<Peer>, timeout: Duration, runtime: Handle) -> Self {
        Self { peer, timeout, runtime }
    }
}

impl CallbackRouter for PeerCallbacks {
    fn call(&self, reference: &Reference, method: &str, param_types: Vec<String>, args: Vec<u8>) -> Result<Vec<u8>, Fault> {
        let request = Request::InvokeCallback {
            reference: reference.id,
            method: method.to_string(),
            param_types,
            args,
        };
        let destination = Destination::Queue(reference.owner.clone());
        debug!(reference = %reference, method, "callback");
        let response = self
            .runtime
            .block_on(self.peer.request(&destination, None, request, self.timeout))
            .map_err(|e| Fault::raised(format!("callback to {} failed: {}", reference, e)))?;
        match response {
            Response::Value(bytes) => Ok(bytes),
            Response::Failed(fault) => Err(fault),
            other => Err(Fault::raised(format!("unexpected callback response `{}`", other.kind()))),
        }
    }

    fn codec(&self) -> Codec {
        self.peer.codec()
    }
}

/// Typed front for [`CallbackRouter::call`].
pub(crate) fn call_back<A, R>(router: &dyn CallbackRouter, reference: &Reference, method: &str, args: A) -> Result<R, Fault>
where
    A: Args,
    R: DeserializeOwned,
{
    let codec = router.codec();
    let bytes = encode(codec, &args)?;
    let result = router.call(reference, method, A::type_names(), bytes)?;
    codec
        .decode(&result)
        .map_err(|e| Fault::raised(format!("callback result did not decode: {}", e)))
}

/// Answers `InvokeCallback` requests arriving on `queue` from `table`. The
/// listener holds the peer weakly; closing the peer ends it.
pub(crate) async fn serve(peer: &Arc<Peer>, queue: &str, table: Arc<ReferenceTable>) -> peer::Result<()> {
    let weak = Arc::downgrade(peer);
    peer.listen(
        Destination::Queue(queue.to_string()),
        |envelope| matches!(envelope.as_request(), Some(Request::InvokeCallback { .. })),
        move |envelope| {
            let weak = weak.clone();
            let table = table.clone();
            async move {
                let Some(Request::InvokeCallback {
                    reference,
                    method,
                    param_types,
                    args,
                }) = envelope.as_request().cloned()
                else {
                    return;
                };
                let Some(peer) = weak.upgrade() else { return };
                let codec = peer.codec();
                let result = tokio::task::spawn_blocking(move || table.dispatch(reference, &method, &param_types, &args, codec))
                    .await
                    .unwrap_or_else(|e| Err(Fault::new(FaultKind::Panicked, e.to_string())));
                let Some(reply_to) = envelope.reply_to else { return };
                if let Err(e) = peer.respond(&reply_to, envelope.correlation_id, Response::from(result.map(Response::Value))).await {
                    warn!(reference = %reference, error = %e, "failed to answer callback");
                }
            }
        },
    )
    .await
}
