//! Courier Runtime
//!
//! The moving parts of a Courier deployment:
//!
//! - [`gateway`]: per-connection session actors and the gateway service
//! - [`directory`]: the session directory, connect/disconnect coordination
//!   and the push producer
//! - [`offline`]: the reference-counted offline message store
//! - [`delivery`]: queue consumers that fan messages out to gateways
//! - [`queue`]: the durable queue abstraction and its in-memory backend
//! - [`rpc`]: traits for the calls that cross process boundaries
//!
//! Enable the `redis` feature for Redis-backed directory and offline stores.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod delivery;
pub mod directory;
pub mod gateway;
pub mod offline;
pub mod queue;
pub mod rpc;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use delivery::{process, DeliveryContext, DeliveryService, Outcome};
pub use directory::{
    DirectoryCoordinator, MemoryDirectory, PushRequest, PushService, SessionDirectory,
};
pub use gateway::{Gateway, GatewayTable, SessionHandle, SessionRegistry, SessionState};
pub use offline::{MemoryOfflineStore, OfflineBatch, OfflineRead, OfflineStore};
pub use queue::{Consumer, Delivery, MemoryConsumer, MemoryQueue, Producer, Record};
pub use rpc::{Authenticator, Credentials, DirectoryClient, GatewayClient, GatewayResolver};

#[cfg(feature = "redis")]
pub use directory::RedisDirectory;
#[cfg(feature = "redis")]
pub use offline::RedisOfflineStore;

pub use courier_core::{CourierError, CourierResult};
