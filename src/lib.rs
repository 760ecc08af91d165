//! # overlay-dht - XOR-Metric Overlay Network
//!
//! overlay-dht provides a Kademlia-style structured overlay built on:
//!
//! - **Identity**: 160-bit node ids compared by XOR distance
//! - **DHT**: iterative lookups, replicated multi-creator records and greedy
//!   message routing
//! - **RPC**: request/response and notification dispatch over any
//!   [`transport::Transport`], multiplexed per service id
//! - **Record store**: keeps the local node published under a well-known key
//!   so that late joiners can find entry points
//!
//! ## Architecture
//!
//! The DHT uses the **Actor Pattern** for its mutable state:
//! - [`DhtNode`] is a cheap-to-clone handle talking to a private actor over
//!   async channels
//! - The actor owns the routing table, the local record store and both
//!   duplicate detectors, and processes commands sequentially
//! - Network I/O (lookups, fan-out stores) runs on the handle side so that
//!   slow peers never block the actor
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Node ids, distance helpers, peer descriptors |
//! | `dht` | Membership, lookups, storage and routing |
//! | `record_store` | Self-publication under the entry-point key |
//! | `rpc` | Request/response correlation and the DHT wire client |
//! | `transport` | Transport traits, in-memory simulator and service mux |
//! | `protocols` | Protocol trait definitions (DhtNodeRpc, DhtStorage) |
//! | `messages` | Serialization types for all wire protocols |
//! | `contact_list` | Distance-sorted candidate lists for lookups |
//! | `duplicate` | Exact duplicate detection for delivered messages |
//! | `bloom` | Probabilistic duplicate detection for forwarded messages |
//! | `store` | Local per-key, per-creator record storage |
//! | `ttl_cache` | Expiring bounded key/value map |

pub mod bloom;
pub mod config;
pub mod contact_list;
pub mod dht;
pub mod duplicate;
pub mod identity;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod record_store;
pub mod rpc;
pub mod store;
pub mod transport;
pub mod ttl_cache;

pub use dht::{DhtConfig, DhtError, DhtNode, DhtStats, NodeState};
pub use identity::{NodeId, NodeKind, PeerIdentity};
pub use messages::RoutedMessage;
pub use node::{Node, NodeConfig};
pub use record_store::{RecordStoreManager, StoreRefreshError};
pub use rpc::{RpcCommunicator, RpcConfig, RpcError};
pub use store::StoredRecordEntry;
pub use transport::{SimulatorNetwork, Transport};
