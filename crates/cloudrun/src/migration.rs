//! # Migration Engine
//!
//! Moves a live object from one host to another while keeping its id.
//!
//! The host-side steps live here: [`serialize`] on the source, [`deploy`] on
//! the target, [`abort`] on the source when the deploy fails. The manager
//! drives them in order (serialize, deploy, then remove on the source) and
//! only repoints the object after the target has confirmed the deploy.

use std::fmt;
use std::sync::Arc;

use cloudrpc::Codec;
use cloudrpc::Fault;
use cloudrpc::FaultKind;
use cloudrpc::HostId;
use cloudrpc::ObjectId;

use crate::context::ObjectContext;
use crate::instance::RemoteObject;
use crate::ledger::ClassDef;
use crate::ledger::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStage {
    /// Checks before anything is sent: target lookup, placement, startup.
    Prepare,
    Serialize,
    Deploy,
    Remove,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Serialize => "serialize",
            Self::Deploy => "deploy",
            Self::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// One migration in flight. Never persisted.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub object_id: ObjectId,
    pub source: HostId,
    pub target: HostId,
    pub class: String,
    pub state: Vec<u8>,
}

/// Source side: runs pre-migration hooks, clears transient and framework
/// fields and encodes what remains. On failure the object is left prepared;
/// the manager follows up with [`abort`].
pub fn serialize(object: &RemoteObject, codec: Codec) -> Result<(String, Vec<u8>), Fault> {
    if !object.class().is_migratable() {
        return Err(Fault::new(
            FaultKind::NotMigratable,
            format!("class `{}` is not migratable", object.class().name()),
        ));
    }
    object.with_instance(|class, instance| {
        class.prepare_for_migration(instance)?;
        let state = class.encode_state(instance, codec)?;
        Ok((class.name().to_string(), state))
    })
}

/// Target side: decodes state into a fresh instance, reinitialises transient
/// fields, runs post-migration hooks and reinjects framework fields.
pub fn deploy(
    class: &Arc<ClassDef>,
    id: ObjectId,
    state: &[u8],
    codec: Codec,
    context: &ObjectContext,
) -> Result<Instance, Fault> {
    let mut instance = class.decode_state(state, codec)?;
    class.restore_after_migration(instance.as_mut())?;
    class.inject(instance.as_mut(), id, context)?;
    Ok(instance)
}

/// Source side, after a failed deploy: undoes [`serialize`] in place.
pub fn abort(object: &RemoteObject, context: &ObjectContext) -> Result<(), Fault> {
    object.with_instance(|class, instance| {
        class.restore_after_migration(instance)?;
        class.inject(instance, object.id(), context)
    })
}
