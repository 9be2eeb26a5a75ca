//! Service Boundaries
//!
//! Traits for the calls that cross process boundaries. The transport behind
//! them (gRPC, HTTP, in-process) is supplied by the embedding application;
//! the runtime only depends on these seams.

use async_trait::async_trait;
use courier_core::{
    CourierResult, GatewayId, Identity, KickoutReason, Message, Sid, Uid,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Authentication
// ----------------------------------------------------------------------------

/// Opaque connection credentials (headers, token fields, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub fields: HashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Resolves credentials to a user identity
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> CourierResult<Identity>;
}

// ----------------------------------------------------------------------------
// Directory
// ----------------------------------------------------------------------------

/// Calls a gateway makes to the directory when sessions open and close
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        gateway_id: &GatewayId,
        sid: &Sid,
    ) -> CourierResult<Identity>;

    async fn disconnect(&self, gateway_id: &GatewayId, sid: &Sid, uid: &Uid) -> CourierResult<()>;
}

// ----------------------------------------------------------------------------
// Gateway
// ----------------------------------------------------------------------------

/// Calls the delivery coordinator makes to a gateway
///
/// Both methods fail with `NotFound` when the gateway no longer hosts `sid`.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn push_messages(
        &self,
        sid: &Sid,
        ack_wait: Duration,
        messages: Vec<Message>,
    ) -> CourierResult<()>;

    async fn kickout(&self, sid: &Sid, reason: KickoutReason) -> CourierResult<()>;
}

/// Maps gateway ids to clients
pub trait GatewayResolver: Send + Sync {
    /// `Ok(None)`: the gateway is gone and its sessions are stale.
    /// `Err`: the gateway exists but cannot be reached right now.
    fn resolve(&self, gateway_id: &GatewayId) -> CourierResult<Option<Arc<dyn GatewayClient>>>;
}
