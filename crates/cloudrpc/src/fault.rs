use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Why a host could not satisfy a request.
///
/// These are distinct from [`crate::Error`]; a fault means the *remote* side
/// failed, whereas an `Error` means the wire failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// The class is not known to the host for this client.
    NoSuchClass,
    /// No constructor matches the given parameter types.
    NoSuchConstructor,
    /// No method matches the given name and parameter types.
    NoSuchMethod,
    /// The class exposes no field with this name.
    NoSuchField,
    /// The object id is not resident on the host.
    NoSuchObject,
    /// Arguments or values did not decode into the declared types.
    BadArguments,
    /// User code returned an error.
    Raised,
    /// User code panicked.
    Panicked,
    /// The class does not support migration.
    NotMigratable,
    /// A migration step failed on the host.
    Migration,
    /// The reference was released or never exported by its owner.
    NoSuchReference,
}

/// A remote failure carried back to the caller as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn raised(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Raised, message)
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(FaultKind::BadArguments, message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}
