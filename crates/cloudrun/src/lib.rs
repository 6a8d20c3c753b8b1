//! # cloudrun
//!
//! A runtime for remote objects. Application code creates objects through a
//! [`CloudManager`]; the manager places each one on a host chosen by a
//! [`ScalingPolicy`](policy::ScalingPolicy), starting hosts as needed, and
//! forwards every invocation and field access over a message bus.
//!
//! ## Architecture
//!
//! - [`transport`]: the bus abstraction, queues and topics of opaque bytes.
//! - [`peer`]: correlated request/response on top of a transport.
//! - [`server`]: the host side; runs objects registered in a [`ledger`].
//! - [`pool`], [`policy`], [`launcher`]: which hosts exist and where objects go.
//! - [`manager`]: the client side; placement, invocation, migration, scale-down.
//! - [`bind`]: stubs that stand in for remote objects.
//! - [`reference`]: client objects handed to hosts by reference, and the
//!   callbacks hosts make into them.

pub mod bind;
pub mod builder;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod host;
pub mod instance;
pub mod launcher;
pub mod ledger;
pub mod local_transport;
pub mod manager;
pub mod migration;
pub mod peer;
pub mod policy;
pub mod pool;
pub mod reference;
pub mod server;
pub mod telemetry;
pub mod transport;

pub use cloudrpc::ClientId;
pub use cloudrpc::Codec;
pub use cloudrpc::HostId;
pub use cloudrpc::ObjectId;
pub use error::Error;
pub use error::Result;
pub use manager::ClientHandle;
pub use manager::CloudManager;
