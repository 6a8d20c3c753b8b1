use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::id::ReferenceId;

/// A by-reference argument. The object stays with its owner; whoever holds
/// the reference reaches it by sending [`crate::Request::InvokeCallback`] to
/// `owner`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    /// Queue the owner serves callbacks on.
    pub owner: String,
    /// Type name of the referenced object, for diagnostics.
    pub class: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}@{})", self.class, self.id, self.owner)
    }
}
