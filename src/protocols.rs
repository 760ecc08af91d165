//! Protocol trait definitions.
//!
//! Traits live here, apart from their implementations, so the DHT can be
//! driven by any network (RPC over a real transport, or a direct in-memory
//! wiring in unit tests) and the record store by any DHT.
//!
//! | Trait | Implemented by | Consumed by |
//! |-------|----------------|-------------|
//! | [`DhtNodeRpc`] | [`crate::rpc::DhtRpcClient`] | [`crate::dht::DhtNode`] |
//! | [`DhtStorage`] | [`crate::dht::DhtNode`] | [`crate::record_store::RecordStoreManager`] |

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{NodeId, PeerIdentity};
use crate::messages::{RouteAck, RoutedMessage};
use crate::store::StoredRecordEntry;

/// Remote DHT operations against a single peer.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Check liveness.
    async fn ping(&self, to: &PeerIdentity) -> Result<()>;

    /// Up to `limit` peers `to` knows closest to `target`.
    async fn find_closest_nodes(
        &self,
        to: &PeerIdentity,
        target: NodeId,
        limit: usize,
    ) -> Result<Vec<PeerIdentity>>;

    /// Ask `to` to hold `entry`. `Ok(false)` means the peer refused it.
    async fn store_data(&self, to: &PeerIdentity, entry: StoredRecordEntry) -> Result<bool>;

    /// Entries `to` holds under `key`.
    async fn find_data(&self, to: &PeerIdentity, key: NodeId) -> Result<Vec<StoredRecordEntry>>;

    /// Mark the entry of `creator` under `key` as deleted on `to`.
    async fn delete_data(&self, to: &PeerIdentity, key: NodeId, creator: NodeId) -> Result<bool>;

    /// Hand a routed message to the next hop.
    async fn route_message(&self, to: &PeerIdentity, message: RoutedMessage) -> Result<RouteAck>;

    /// One-way notice that the local node is leaving.
    async fn leave_notice(&self, to: &PeerIdentity) -> Result<()>;

    /// One-way copy of a locally held entry for `to` to keep.
    async fn replicate_data(&self, to: &PeerIdentity, entry: StoredRecordEntry) -> Result<()>;
}

/// Storage primitives of the whole overlay.
#[async_trait]
pub trait DhtStorage: Send + Sync + 'static {
    /// Merged view of every entry stored under `key` by the closest nodes.
    async fn fetch_data_from_dht(&self, key: NodeId) -> Result<Vec<StoredRecordEntry>>;

    /// Store `value` under `key`, returning the peers that acknowledged.
    async fn store_data_to_dht(&self, key: NodeId, value: Vec<u8>) -> Result<Vec<PeerIdentity>>;

    /// Delete the local node's entry under `key`.
    async fn delete_data_from_dht(&self, key: NodeId, wait_for_completion: bool) -> Result<()>;
}
