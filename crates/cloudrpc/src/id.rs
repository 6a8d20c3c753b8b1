//! Strongly typed identifiers.
//!
//! All ids are random 128-bit UUIDs. They are `Copy`, hashable, and display
//! with a short prefix so log lines stay readable.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0.simple())
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identity of a cloud object. Assigned by the host that constructs it and
    /// kept for the object's whole life, migrations included.
    ObjectId,
    "obj"
);

uuid_id!(
    /// Identity of a host known to a host pool.
    HostId,
    "host"
);

uuid_id!(
    /// Identity of a client runtime. Hosts scope class lookups by it.
    ClientId,
    "client"
);

uuid_id!(
    /// Links a request to its response.
    CorrelationId,
    "corr"
);

uuid_id!(
    /// Names a client-resident object handed to a host by reference.
    ReferenceId,
    "ref"
);
