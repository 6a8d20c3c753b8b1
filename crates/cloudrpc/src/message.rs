//! # Message Vocabulary
//!
//! One [`Request`] variant per operation a host understands, and the
//! [`Response`] shapes it may answer with.
//!
//! ## Invariants
//!
//! - A response always carries the correlation id of the request it answers.
//! - One-way requests (`KeepAlive`, `Shutdown`) are never answered.
//! - `Probe` is published on a topic; every listening host answers it.

use serde::Deserialize;
use serde::Serialize;

use crate::fault::Fault;
use crate::id::ClientId;
use crate::id::CorrelationId;
use crate::id::ObjectId;
use crate::id::ReferenceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    CreateObject {
        class: String,
        param_types: Vec<String>,
        args: Vec<u8>,
    },
    StartInvocation {
        object_id: ObjectId,
        method: String,
        param_types: Vec<String>,
        args: Vec<u8>,
    },
    GetFieldValue {
        object_id: ObjectId,
        field: String,
    },
    SetFieldValue {
        object_id: ObjectId,
        field: String,
        value: Vec<u8>,
    },
    DeleteObject {
        object_id: ObjectId,
    },
    KeepAlive {
        object_id: ObjectId,
    },
    SerializeForMigration {
        object_id: ObjectId,
    },
    DeployMigrated {
        object_id: ObjectId,
        class: String,
        state: Vec<u8>,
    },
    RemoveMigrated {
        object_id: ObjectId,
    },
    /// Undo a `SerializeForMigration` whose deploy failed; the object stays put.
    AbortMigration {
        object_id: ObjectId,
    },
    Shutdown,
    Probe,
    /// Sent by a host to the owner of a [`crate::Reference`]; answered like an
    /// invocation.
    InvokeCallback {
        reference: ReferenceId,
        method: String,
        param_types: Vec<String>,
        args: Vec<u8>,
    },
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateObject { .. } => "create_object",
            Self::StartInvocation { .. } => "start_invocation",
            Self::GetFieldValue { .. } => "get_field_value",
            Self::SetFieldValue { .. } => "set_field_value",
            Self::DeleteObject { .. } => "delete_object",
            Self::KeepAlive { .. } => "keep_alive",
            Self::SerializeForMigration { .. } => "serialize_for_migration",
            Self::DeployMigrated { .. } => "deploy_migrated",
            Self::RemoveMigrated { .. } => "remove_migrated",
            Self::AbortMigration { .. } => "abort_migration",
            Self::Shutdown => "shutdown",
            Self::Probe => "probe",
            Self::InvokeCallback { .. } => "invoke_callback",
        }
    }

    /// Whether the sender expects no answer.
    pub fn is_one_way(&self) -> bool {
        matches!(self, Self::KeepAlive { .. } | Self::Shutdown)
    }

    /// The object this request targets, if any.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::StartInvocation { object_id, .. }
            | Self::GetFieldValue { object_id, .. }
            | Self::SetFieldValue { object_id, .. }
            | Self::DeleteObject { object_id }
            | Self::KeepAlive { object_id }
            | Self::SerializeForMigration { object_id }
            | Self::DeployMigrated { object_id, .. }
            | Self::RemoveMigrated { object_id }
            | Self::AbortMigration { object_id } => Some(*object_id),
            Self::CreateObject { .. } | Self::Shutdown | Self::Probe | Self::InvokeCallback { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Created { object_id: ObjectId },
    /// An invocation result or a field value.
    Value(Vec<u8>),
    Ack,
    Migrated { class: String, state: Vec<u8> },
    ProbeReply { address: String },
    Failed(Fault),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Value(_) => "value",
            Self::Ack => "ack",
            Self::Migrated { .. } => "migrated",
            Self::ProbeReply { .. } => "probe_reply",
            Self::Failed(_) => "failed",
        }
    }
}

impl From<Result<Response, Fault>> for Response {
    fn from(result: Result<Response, Fault>) -> Self {
        result.unwrap_or_else(Response::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// The unit of transfer on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    /// Where the answer should be published. Absent for one-way messages.
    pub reply_to: Option<String>,
    pub client_id: Option<ClientId>,
    pub body: Body,
}

impl Envelope {
    pub fn request(
        correlation_id: CorrelationId,
        client_id: Option<ClientId>,
        reply_to: Option<String>,
        request: Request,
    ) -> Self {
        Self {
            correlation_id,
            reply_to,
            client_id,
            body: Body::Request(request),
        }
    }

    pub fn response(correlation_id: CorrelationId, response: Response) -> Self {
        Self {
            correlation_id,
            reply_to: None,
            client_id: None,
            body: Body::Response(response),
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match &self.body {
            Body::Request(request) => Some(request),
            Body::Response(_) => None,
        }
    }
}
