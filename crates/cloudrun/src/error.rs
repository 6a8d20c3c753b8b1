//! # Error Definitions
//!
//! Every public operation of the runtime either succeeds or returns exactly one
//! of these. Nothing here is retried automatically; `destroy` is the only
//! operation that is safe to repeat.

use std::time::Duration;

use cloudrpc::Fault;
use cloudrpc::HostId;
use cloudrpc::ObjectId;

use crate::migration::MigrationStage;
use crate::peer;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No response within the request deadline. The remote side may still
    /// complete the operation.
    #[error("{operation} timed out after {timeout:?}")]
    RemoteTimeout { operation: &'static str, timeout: Duration },

    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("object {0} has been destroyed")]
    DestroyedObject(ObjectId),

    /// A field write on a stub whose object does not exist yet, under the
    /// `reject` policy.
    #[error("object of class `{class}` is not registered yet")]
    NotRegistered { class: String },

    #[error("stub is already bound to {0}")]
    AlreadyCreated(ObjectId),

    #[error("constructing `{class}` failed remotely: {fault}")]
    RemoteConstruction { class: String, fault: Fault },

    #[error("{operation} on {object_id} failed remotely: {fault}")]
    RemoteInvocation {
        object_id: ObjectId,
        operation: String,
        fault: Fault,
    },

    #[error("host launch failed: {0}")]
    HostLaunch(String),

    #[error("host {host} unavailable: {reason}")]
    HostUnavailable { host: HostId, reason: String },

    /// The scaling policy returned no usable host.
    #[error("scaling policy selected no host for `{class}`")]
    NoHostSelected { class: String },

    /// The object is still live on the host named in `reason`.
    #[error("migration of {object_id} failed during {stage}: {reason}")]
    Migration {
        object_id: ObjectId,
        stage: MigrationStage,
        reason: String,
    },

    #[error("unexpected response to {operation}: {received}")]
    UnexpectedResponse { operation: &'static str, received: &'static str },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(#[from] cloudrpc::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("runtime is stopped")]
    Stopped,
}

impl From<peer::Error> for Error {
    fn from(e: peer::Error) -> Self {
        match e {
            peer::Error::Timeout(timeout) => Self::RemoteTimeout {
                operation: "request",
                timeout,
            },
            peer::Error::Codec(e) => Self::Codec(e),
            other => Self::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
