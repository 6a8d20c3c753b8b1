//! # Scaling Policies
//!
//! A [`ScalingPolicy`] decides where each new object goes and when an empty
//! host may be let go. The manager calls both methods while holding the pool's
//! placement lock, so a policy sees a consistent pool and may start hosts
//! without racing other placements.
//!
//! Returning `None` from `select_host`, or a host that no longer accepts
//! placements, is a configuration error and surfaces as
//! [`crate::Error::NoHostSelected`].

use std::sync::Arc;

use crate::error::Result;
use crate::host::Host;
use crate::pool::HostPool;

/// What the policy knows about the object being placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub class: String,
    pub param_types: Vec<String>,
}

#[async_trait::async_trait]
pub trait ScalingPolicy: Send + Sync + 'static {
    async fn select_host(&self, object: &ObjectDescriptor, pool: &HostPool) -> Result<Option<Arc<Host>>>;

    /// Asked after every destroy and on the scale-down timer, only for hosts
    /// with no objects. `true` shuts the host down.
    async fn scale_down(&self, host: &Arc<Host>, pool: &HostPool) -> bool;
}

fn first_placeable(pool: &HostPool, accept: impl Fn(&Host) -> bool) -> Option<Arc<Host>> {
    pool.hosts().into_iter().find(|h| h.is_placeable() && accept(h.as_ref()))
}

/// Every object shares one host, started on first use.
#[derive(Debug, Clone, Default)]
pub struct SingleHostPolicy {
    start_async: bool,
}

impl SingleHostPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the host in the background; creations wait for it to come up.
    pub fn starting_async(mut self) -> Self {
        self.start_async = true;
        self
    }
}

#[async_trait::async_trait]
impl ScalingPolicy for SingleHostPolicy {
    async fn select_host(&self, _object: &ObjectDescriptor, pool: &HostPool) -> Result<Option<Arc<Host>>> {
        if let Some(host) = first_placeable(pool, |_| true) {
            return Ok(Some(host));
        }
        if self.start_async {
            Ok(Some(pool.start_new_host_async(None)))
        } else {
            pool.start_new_host(None).await.map(Some)
        }
    }

    async fn scale_down(&self, _host: &Arc<Host>, _pool: &HostPool) -> bool {
        true
    }
}

/// One object per host. Empty hosts are reused before new ones are started.
#[derive(Debug, Clone, Default)]
pub struct HostPerObjectPolicy;

#[async_trait::async_trait]
impl ScalingPolicy for HostPerObjectPolicy {
    async fn select_host(&self, _object: &ObjectDescriptor, pool: &HostPool) -> Result<Option<Arc<Host>>> {
        if let Some(host) = first_placeable(pool, |h| h.object_count() == 0) {
            return Ok(Some(host));
        }
        pool.start_new_host(None).await.map(Some)
    }

    async fn scale_down(&self, _host: &Arc<Host>, _pool: &HostPool) -> bool {
        true
    }
}

/// Objects of the same class share a host; each class gets its own.
#[derive(Debug, Clone, Default)]
pub struct TypeAffinityPolicy;

#[async_trait::async_trait]
impl ScalingPolicy for TypeAffinityPolicy {
    async fn select_host(&self, object: &ObjectDescriptor, pool: &HostPool) -> Result<Option<Arc<Host>>> {
        if let Some(host) = first_placeable(pool, |h| h.hosts_class(&object.class)) {
            return Ok(Some(host));
        }
        pool.start_new_host(None).await.map(Some)
    }

    async fn scale_down(&self, _host: &Arc<Host>, _pool: &HostPool) -> bool {
        true
    }
}
