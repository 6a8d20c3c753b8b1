//! # cloudrpc
//!
//! The wire vocabulary spoken between a cloud manager and the hosts it drives.
//!
//! ## Architecture
//!
//! Every message on the bus is an [`Envelope`]: a correlation id, an optional
//! reply address, the id of the originating client, and a body that is either a
//! [`Request`] or a [`Response`]. Responses are matched to requests purely by
//! correlation id, so any number of requests may be outstanding at once.
//!
//! Remote failures are data, not dropped messages: a host that cannot satisfy a
//! request answers with [`Response::Failed`] carrying a [`Fault`].
//!
//! Payloads (constructor arguments, results, field values, migrated state) are
//! opaque byte strings produced by the same [`Codec`] that frames envelopes.
//!
//! Arguments may also travel by reference: a [`Reference`] names an object that
//! stays with its owner, and a host calls it back with
//! [`Request::InvokeCallback`].

mod codec;
mod error;
mod fault;
mod id;
mod message;
mod reference;

pub use codec::Codec;
pub use error::Error;
pub use error::Result;
pub use fault::Fault;
pub use fault::FaultKind;
pub use id::ClientId;
pub use id::CorrelationId;
pub use id::HostId;
pub use id::ObjectId;
pub use id::ReferenceId;
pub use message::Body;
pub use message::Envelope;
pub use message::Request;
pub use message::Response;
pub use reference::Reference;

#[cfg(test)]
mod tests;
