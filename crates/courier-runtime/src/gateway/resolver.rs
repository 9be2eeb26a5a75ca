//! Gateway lookup by id
//!
//! [`GatewayTable`] is the in-process [`GatewayResolver`]: gateways register
//! themselves on start and deregister on shutdown. Ids that were never
//! registered resolve to `Ok(None)` (stale sessions); ids marked unreachable
//! resolve to `Unavailable` so the caller retries.

use crate::rpc::{GatewayClient, GatewayResolver};
use courier_core::{CourierError, CourierResult, GatewayId};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct GatewayTable {
    gateways: DashMap<GatewayId, Arc<dyn GatewayClient>>,
    unreachable: DashSet<GatewayId>,
}

impl GatewayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, gateway_id: GatewayId, client: Arc<dyn GatewayClient>) {
        self.unreachable.remove(&gateway_id);
        self.gateways.insert(gateway_id, client);
    }

    pub fn deregister(&self, gateway_id: &GatewayId) {
        self.gateways.remove(gateway_id);
        self.unreachable.remove(gateway_id);
    }

    /// Keep the gateway known but fail lookups until it is registered again
    pub fn mark_unreachable(&self, gateway_id: GatewayId) {
        self.unreachable.insert(gateway_id);
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

impl GatewayResolver for GatewayTable {
    fn resolve(&self, gateway_id: &GatewayId) -> CourierResult<Option<Arc<dyn GatewayClient>>> {
        if self.unreachable.contains(gateway_id) {
            return Err(CourierError::unavailable(format!(
                "gateway {} unreachable",
                gateway_id
            )));
        }
        Ok(self
            .gateways
            .get(gateway_id)
            .map(|entry| entry.value().clone()))
    }
}
