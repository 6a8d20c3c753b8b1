//! # Host Handles
//!
//! A [`Host`] is the client-side view of one remote execution node: identity,
//! bus address, declared size, lifecycle state, and the objects the manager
//! has placed on it.
//!
//! ## Invariants
//!
//! - The address is set at most once, when the launch completes, and never
//!   after the host was terminated.
//! - `object_count()` counts resident objects plus placements reserved under
//!   the placement lock but not yet confirmed by the host. Policies see a host
//!   as occupied from the moment it is chosen.
//! - Only `Starting` and `Running` hosts accept new placements.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use cloudrpc::HostId;
use cloudrpc::ObjectId;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    Starting,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Occupancy {
    resident: HashMap<ObjectId, String>,
    reserved: HashMap<String, usize>,
}

impl Occupancy {
    fn reserved_total(&self) -> usize {
        self.reserved.values().sum()
    }

    fn release(&mut self, class: &str) {
        if let Some(count) = self.reserved.get_mut(class) {
            *count -= 1;
            if *count == 0 {
                self.reserved.remove(class);
            }
        }
    }
}

pub struct Host {
    id: HostId,
    size: Option<String>,
    is_static: bool,
    address: RwLock<Option<String>>,
    state: watch::Sender<HostState>,
    started_at: Instant,
    last_request: Mutex<Instant>,
    occupancy: Mutex<Occupancy>,
}

impl Host {
    /// A host about to be launched.
    pub fn starting(id: HostId, size: Option<String>) -> Self {
        Self::build(id, size, false, None, HostState::Starting)
    }

    /// A pre-started host the pool does not own.
    pub fn fixed(address: impl Into<String>) -> Self {
        Self::build(HostId::new(), None, true, Some(address.into()), HostState::Running)
    }

    fn build(id: HostId, size: Option<String>, is_static: bool, address: Option<String>, state: HostState) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            id,
            size,
            is_static,
            address: RwLock::new(address),
            state,
            started_at: Instant::now(),
            last_request: Mutex::new(Instant::now()),
            occupancy: Mutex::new(Occupancy::default()),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn size(&self) -> Option<&str> {
        self.size.as_deref()
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    pub fn is_placeable(&self) -> bool {
        matches!(self.state(), HostState::Starting | HostState::Running)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_request.lock().elapsed()
    }

    pub fn touch(&self) {
        *self.last_request.lock() = Instant::now();
    }

    /// Records the launched address. A `Starting` host becomes `Running`, a
    /// host drained while starting keeps draining. Returns `false` when the
    /// host was terminated before the launch finished; the caller then owns
    /// the address and must tear it down.
    pub(crate) fn mark_running(&self, address: String) -> bool {
        let mut admitted = false;
        self.state.send_if_modified(|state| match *state {
            HostState::Starting => {
                *self.address.write() = Some(address);
                *state = HostState::Running;
                admitted = true;
                true
            }
            HostState::Draining => {
                *self.address.write() = Some(address);
                admitted = true;
                true
            }
            HostState::Running | HostState::Terminated => false,
        });
        admitted
    }

    /// Moves the host to `Terminated` and returns the address, if the launch
    /// got that far. Atomic with respect to [`Self::mark_running`].
    pub(crate) fn mark_terminated(&self) -> Option<String> {
        let mut address = None;
        self.state.send_modify(|state| {
            *state = HostState::Terminated;
            address = self.address.read().clone();
        });
        address
    }

    /// `Starting` or `Running` to `Draining`. Returns whether the host is
    /// draining afterwards.
    pub(crate) fn mark_draining(&self) -> bool {
        self.state.send_if_modified(|state| match *state {
            HostState::Starting | HostState::Running => {
                *state = HostState::Draining;
                true
            }
            HostState::Draining | HostState::Terminated => false,
        });
        self.state() == HostState::Draining
    }

    /// Waits while the host is `Starting`.
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = |s: &HostState| match s {
            HostState::Starting => false,
            HostState::Draining => self.address.read().is_some(),
            HostState::Running | HostState::Terminated => true,
        };
        let state = match tokio::time::timeout(timeout, rx.wait_for(settled)).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => HostState::Terminated,
            Err(_) => {
                return Err(Error::HostUnavailable {
                    host: self.id,
                    reason: format!("not running after {:?}", timeout),
                });
            }
        };
        match state {
            HostState::Running | HostState::Draining => Ok(()),
            HostState::Terminated => Err(Error::HostLaunch(format!("{} terminated before it was running", self.id))),
            HostState::Starting => Err(Error::HostUnavailable {
                host: self.id,
                reason: "still starting".into(),
            }),
        }
    }

    /// Resident objects plus reserved placements.
    pub fn object_count(&self) -> usize {
        let occupancy = self.occupancy.lock();
        occupancy.resident.len() + occupancy.reserved_total()
    }

    pub fn resident_count(&self) -> usize {
        self.occupancy.lock().resident.len()
    }

    pub fn objects(&self) -> Vec<ObjectId> {
        self.occupancy.lock().resident.keys().copied().collect()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.occupancy.lock().resident.contains_key(id)
    }

    /// Whether an object of `class` lives here or is about to.
    pub fn hosts_class(&self, class: &str) -> bool {
        let occupancy = self.occupancy.lock();
        occupancy.reserved.contains_key(class) || occupancy.resident.values().any(|c| c == class)
    }

    pub(crate) fn reserve(&self, class: &str) {
        *self.occupancy.lock().reserved.entry(class.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn cancel_reservation(&self, class: &str) {
        self.occupancy.lock().release(class);
    }

    /// Turns a reservation into a resident object.
    pub(crate) fn commit(&self, id: ObjectId, class: &str) {
        let mut occupancy = self.occupancy.lock();
        occupancy.release(class);
        occupancy.resident.insert(id, class.to_string());
    }

    pub(crate) fn detach(&self, id: &ObjectId) -> bool {
        self.occupancy.lock().resident.remove(id).is_some()
    }

    pub(crate) fn clear(&self) -> Vec<ObjectId> {
        let mut occupancy = self.occupancy.lock();
        occupancy.reserved.clear();
        occupancy.resident.drain().map(|(id, _)| id).collect()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("state", &self.state())
            .field("static", &self.is_static)
            .field("objects", &self.object_count())
            .finish()
    }
}
