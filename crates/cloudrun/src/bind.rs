//! # Client Stubs
//!
//! A [`CloudStub`] stands in for one cloud object on the client. Method calls
//! and field access are forwarded through the [`CloudManager`] that created
//! it; the stub itself holds no object state.
//!
//! A stub exists before its object does. Field writes issued in that window
//! follow [`FieldWritePolicy`]: buffered and replayed in order right after
//! creation, or rejected. Reads and invocations before creation always fail
//! with [`Error::NotRegistered`].
//!
//! [`cloud_stub!`](crate::cloud_stub) generates a typed wrapper around a
//! stub for a fixed set of methods.

use cloudrpc::ObjectId;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::FieldWritePolicy;
use crate::error::Error;
use crate::error::Result;
use crate::ledger::Args;
use crate::manager::ClientHandle;
use crate::manager::CloudManager;

enum Binding {
    Unbound { pending: Vec<(String, Vec<u8>)> },
    Bound(ClientHandle),
}

pub struct CloudStub {
    manager: CloudManager,
    class: String,
    binding: Mutex<Binding>,
    /// Held for the whole of [`CloudStub::create`], so one stub places at
    /// most one object.
    creating: tokio::sync::Mutex<()>,
}

impl CloudStub {
    /// An unbound stub; call [`Self::create`] to place the object.
    pub fn new(manager: &CloudManager, class: impl Into<String>) -> Self {
        Self {
            manager: manager.clone(),
            class: class.into(),
            binding: Mutex::new(Binding::Unbound { pending: Vec::new() }),
            creating: tokio::sync::Mutex::new(()),
        }
    }

    /// A stub for an object that already exists.
    pub fn attach(manager: &CloudManager, handle: ClientHandle) -> Self {
        Self {
            manager: manager.clone(),
            class: handle.class.clone(),
            binding: Mutex::new(Binding::Bound(handle)),
            creating: tokio::sync::Mutex::new(()),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn handle(&self) -> Option<ClientHandle> {
        match &*self.binding.lock() {
            Binding::Bound(handle) => Some(handle.clone()),
            Binding::Unbound { .. } => None,
        }
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.handle().map(|h| h.id)
    }

    /// Field writes waiting for the object to exist.
    pub fn pending_writes(&self) -> usize {
        match &*self.binding.lock() {
            Binding::Unbound { pending } => pending.len(),
            Binding::Bound(_) => 0,
        }
    }

    fn bound_id(&self) -> Result<ObjectId> {
        match &*self.binding.lock() {
            Binding::Bound(handle) => Ok(handle.id),
            Binding::Unbound { .. } => Err(Error::NotRegistered {
                class: self.class.clone(),
            }),
        }
    }

    /// Creates the object and replays buffered field writes. Concurrent
    /// calls are serialized; all but the first see `AlreadyCreated`.
    pub async fn create<A: Args>(&self, args: A) -> Result<ObjectId> {
        let _creating = self.creating.lock().await;
        if let Some(id) = self.id() {
            return Err(Error::AlreadyCreated(id));
        }
        let handle = self.manager.create_object(&self.class, args).await?;
        let id = handle.id;
        let pending = match std::mem::replace(&mut *self.binding.lock(), Binding::Bound(handle)) {
            Binding::Unbound { pending } => pending,
            Binding::Bound(_) => Vec::new(),
        };
        if !pending.is_empty() {
            debug!(object_id = %id, writes = pending.len(), "replaying buffered field writes");
        }
        for (field, value) in pending {
            self.manager.set_field_raw(id, &field, value).await?;
        }
        Ok(id)
    }

    pub async fn invoke<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: Args,
        R: DeserializeOwned,
    {
        let id = self.bound_id()?;
        self.manager.invoke(id, method, args).await
    }

    pub async fn get<V: DeserializeOwned>(&self, field: &str) -> Result<V> {
        let id = self.bound_id()?;
        self.manager.get_field(id, field).await
    }

    pub async fn set<V: Serialize + ?Sized>(&self, field: &str, value: &V) -> Result<()> {
        let bytes = self.manager.codec().encode(value)?;
        let id = {
            let mut binding = self.binding.lock();
            match &mut *binding {
                Binding::Bound(handle) => handle.id,
                Binding::Unbound { pending } => match self.manager.config().unregistered_field_writes {
                    FieldWritePolicy::Buffer => {
                        pending.push((field.to_string(), bytes));
                        return Ok(());
                    }
                    FieldWritePolicy::Reject => {
                        return Err(Error::NotRegistered {
                            class: self.class.clone(),
                        });
                    }
                },
            }
        };
        self.manager.set_field_raw(id, field, bytes).await
    }

    /// Destroys the object. On an unbound stub this only drops buffered writes.
    pub async fn destroy(&self) -> Result<()> {
        let id = match &mut *self.binding.lock() {
            Binding::Bound(handle) => handle.id,
            Binding::Unbound { pending } => {
                pending.clear();
                return Ok(());
            }
        };
        self.manager.destroy(id).await
    }
}

/// Declares a typed stub for a cloud-object class.
///
/// ```ignore
/// cloud_stub! {
///     pub struct CounterStub => "Counter" {
///         fn add(n: i64) -> i64;
///         fn get() -> i64;
///     }
/// }
///
/// let counter = CounterStub::create(&manager, (5i64,)).await?;
/// assert_eq!(counter.add(2).await?, 7);
/// ```
#[macro_export]
macro_rules! cloud_stub {
    (
        $vis:vis struct $name:ident => $class:literal {
            $( fn $method:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty ; )*
        }
    ) => {
        $vis struct $name {
            stub: $crate::bind::CloudStub,
        }

        impl $name {
            pub const CLASS: &'static str = $class;

            pub async fn create<A: $crate::ledger::Args>(
                manager: &$crate::CloudManager,
                args: A,
            ) -> $crate::Result<Self> {
                let stub = $crate::bind::CloudStub::new(manager, $class);
                stub.create(args).await?;
                Ok(Self { stub })
            }

            pub fn stub(&self) -> &$crate::bind::CloudStub {
                &self.stub
            }

            pub fn id(&self) -> ::std::option::Option<$crate::ObjectId> {
                self.stub.id()
            }

            $(
                pub async fn $method(&self, $( $arg: $ty ),*) -> $crate::Result<$ret> {
                    self.stub.invoke(stringify!($method), ($( $arg, )*)).await
                }
            )*

            pub async fn destroy(&self) -> $crate::Result<()> {
                self.stub.destroy().await
            }
        }
    };
}
