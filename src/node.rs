//! # High-Level Node API
//!
//! A [`Node`] wires the layers of one overlay participant together:
//!
//! ```text
//!   physical Transport ◄── TransportMux ──"dht"──► RpcCommunicator
//!                                                     │
//!                       DhtRpcClient ◄── DhtNode ◄────┘ (registered methods)
//!                                           ▲
//!                                RecordStoreManager
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = SimulatorNetwork::new();
//! let first = Node::spawn_simulated(&network, PeerIdentity::bare(NodeId::random()), NodeConfig::default()).await;
//! first.join(Vec::new()).await?;
//! first.publish_self().await;
//!
//! let second = Node::spawn_simulated(&network, PeerIdentity::bare(NodeId::random()), NodeConfig::default()).await;
//! second.join(vec![first.identity().clone()]).await?;
//!
//! let mut rx = first.messages().await?;
//! second.route(first.node_id(), b"hello".to_vec()).await?;
//! let msg = rx.recv().await;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::dht::{DhtConfig, DhtError, DhtNode, DhtStats};
use crate::identity::{NodeId, PeerIdentity};
use crate::messages::{RoutedMessage, DHT_SERVICE_ID};
use crate::record_store::{RecordStoreConfig, RecordStoreManager, StoreRefreshError};
use crate::rpc::{register_dht_methods, DhtRpcClient, RpcCommunicator, RpcConfig};
use crate::store::StoredRecordEntry;
use crate::transport::{IncomingHandler, SimulatorNetwork, Transport, TransportMux};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc: RpcConfig,
    pub dht: DhtConfig,
    pub record_store: RecordStoreConfig,
}

pub struct Node {
    identity: PeerIdentity,
    mux: Arc<TransportMux>,
    communicator: RpcCommunicator,
    dht: DhtNode<DhtRpcClient>,
    records: RecordStoreManager<DhtNode<DhtRpcClient>>,
    delivered: TakeOnce<RoutedMessage>,
}

impl Node {
    /// Build a node on top of `transport`. Inbound traffic must be fed to
    /// [`Node::incoming_handler`].
    pub async fn new(identity: PeerIdentity, transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let mux = TransportMux::new(transport);
        let communicator = RpcCommunicator::new(Arc::new(mux.channel(DHT_SERVICE_ID)), config.rpc);
        mux.register(DHT_SERVICE_ID, Arc::new(communicator.clone())).await;

        let client = DhtRpcClient::new(communicator.clone(), identity.clone());
        let (dht, delivered) = DhtNode::new(identity.clone(), client, config.dht);
        register_dht_methods(&communicator, dht.clone()).await;

        let records = RecordStoreManager::new(dht.clone(), identity.clone(), config.record_store);

        Self {
            identity,
            mux,
            communicator,
            dht,
            records,
            delivered: tokio::sync::Mutex::new(Some(delivered)),
        }
    }

    /// Build a node attached to an in-memory [`SimulatorNetwork`].
    pub async fn spawn_simulated(network: &SimulatorNetwork, identity: PeerIdentity, config: NodeConfig) -> Self {
        let transport = Arc::new(network.transport_for(identity.clone()));
        let node = Self::new(identity.clone(), transport, config).await;
        network.connect(identity, node.incoming_handler()).await;
        node
    }

    /// Handler the physical transport delivers inbound payloads to.
    pub fn incoming_handler(&self) -> Arc<dyn IncomingHandler> {
        self.mux.clone()
    }

    /// The multiplexer, for registering additional services on the same
    /// transport.
    pub fn mux(&self) -> &Arc<TransportMux> {
        &self.mux
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id
    }

    pub fn communicator(&self) -> &RpcCommunicator {
        &self.communicator
    }

    pub fn dht(&self) -> &DhtNode<DhtRpcClient> {
        &self.dht
    }

    pub fn records(&self) -> &RecordStoreManager<DhtNode<DhtRpcClient>> {
        &self.records
    }

    pub async fn join(&self, entry_points: Vec<PeerIdentity>) -> Result<(), DhtError> {
        self.dht.join(entry_points).await
    }

    /// Start keeping the local identity stored under the entry-point key.
    pub async fn publish_self(&self) {
        self.records.store_and_keep_local_node().await
    }

    /// Identities currently published under the entry-point key.
    pub async fn discover_entry_points(&self) -> Result<Vec<PeerIdentity>, StoreRefreshError> {
        self.records.discover_holders().await
    }

    pub async fn find_closest(&self, target: NodeId) -> Result<Vec<PeerIdentity>, DhtError> {
        self.dht.find_closest_nodes_from_dht(target).await
    }

    pub async fn store(&self, key: NodeId, value: Vec<u8>) -> Result<Vec<PeerIdentity>, DhtError> {
        self.dht.store_value(key, value).await
    }

    pub async fn fetch(&self, key: NodeId) -> Result<Vec<StoredRecordEntry>, DhtError> {
        self.dht.fetch_value(key).await
    }

    pub async fn delete(&self, key: NodeId, wait_for_completion: bool) -> Result<(), DhtError> {
        self.dht.delete_value(key, wait_for_completion).await
    }

    pub async fn route(&self, target: NodeId, payload: Vec<u8>) -> Result<(), DhtError> {
        self.dht.route_message(target, payload).await
    }

    /// Routed messages addressed to this node. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<RoutedMessage>> {
        let mut guard = self.delivered.lock().await;
        guard.take().context("message receiver already taken")
    }

    pub async fn stats(&self) -> DhtStats {
        self.dht.stats().await
    }

    /// Withdraw the local record, leave the overlay and reject every
    /// outstanding call.
    pub async fn stop(&self) {
        self.records.destroy_and_wait().await;
        self.dht.stop().await;
        self.communicator.stop().await;
        self.mux.unregister(DHT_SERVICE_ID).await;
        info!(node = ?hex::encode(&self.identity.node_id.as_bytes()[..8]), "node stopped");
    }
}
