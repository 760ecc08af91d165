//! # XOR-metric Distributed Hash Table
//!
//! A Kademlia-style overlay node: membership, iterative closest-node
//! discovery, replicated record storage and greedy message routing.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `join(entry_points)` | Enter an overlay (or start a new one) |
//! | `find_closest_nodes_from_dht(id)` | k closest peers to an id, ascending |
//! | `store_value(key, value)` | Replicate the local entry under `key` |
//! | `fetch_value(key)` | Merged view of all creators' entries under `key` |
//! | `delete_value(key, wait)` | Mark the local entry under `key` deleted |
//! | `route_message(target, payload)` | Deliver a payload to the peer owning `target` |
//! | `stop()` | Leave the overlay, handing stored data to neighbours |
//!
//! ## Lifecycle
//!
//! ```text
//!   Created ──join──► Joining ──ok──► Joined ──stop──► Stopped
//!      ▲                 │              │
//!      └──── no reply ───┘              └──join (re-join)──► Joining
//! ```
//!
//! A re-join that reaches no entry point leaves the node `Joined`.
//!
//! ## Actor Architecture
//!
//! - `DhtNode`: public handle, cheap to clone
//! - `DhtNodeActor`: owns the routing list, local store and both duplicate
//!   detectors; mutated one command at a time
//! - All network I/O happens on the handle side, never inside the actor
//!
//! ## Routing
//!
//! Routed messages travel hop by hop towards the peer whose id equals the
//! target. Each hop tries its known peers in order of distance to the target,
//! skipping peers already on the routing path. A forwarding hop only
//! considers peers strictly closer to the target than the hop it received the
//! message from, and gives up after [`MAX_FAILED_HOPS`] refusals. Forwarding
//! hops suppress repeats with a [`RouterDuplicateDetector`]; the destination
//! delivers at most once per request id using a [`DuplicateDetector`].
//!
//! ## Replication
//!
//! When a new contact shows up, every stored key is re-checked: the stale
//! flag is recomputed, and if this node is the closest known holder and the
//! newcomer ranks among the `redundancy_factor` closest, the entries are
//! pushed to it with a `replicateData` notification. A stopping node hands
//! its entries to the closest remaining contacts before it leaves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bloom::{RouterDuplicateDetector, RouterDuplicateDetectorConfig};
use crate::contact_list::ContactList;
use crate::duplicate::{DuplicateDetector, DuplicateDetectorConfig};
use crate::identity::{distance_cmp, Distance, NodeId, PeerIdentity};
use crate::messages::{RouteAck, RouteFailure, RoutedMessage};
use crate::protocols::{DhtNodeRpc, DhtStorage};
use crate::store::{LocalDataStore, StoreOutcome, StoredRecordEntry};

/// Default replication / result size.
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

/// Default number of holders a store tries to reach.
pub const DEFAULT_REDUNDANCY_FACTOR: usize = 5;

/// Routing list capacity. Contacts farther than the 200 closest are dropped.
pub const DEFAULT_ROUTING_CAPACITY: usize = 200;

/// Parallel next hops tried by the node that originates a routed message.
const ORIGIN_ROUTING_PARALLELISM: usize = 2;

/// Parallel next hops tried by a forwarding node.
const FORWARD_ROUTING_PARALLELISM: usize = 1;

/// Routed messages whose path grows beyond this are dropped.
const MAX_ROUTING_HOPS: usize = 64;

/// Refused or failed next hops after which a hop stops trying.
pub const MAX_FAILED_HOPS: usize = 2;

/// Next-hop candidates considered per hop.
const ROUTING_CANDIDATES: usize = 10;

/// Pending replica pushes. Replicas beyond this are dropped.
const REPLICATION_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub routing_capacity: usize,
    pub max_lookup_iterations: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub per_query_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub lookup_timeout: Duration,
    pub redundancy_factor: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub store_default_ttl: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub store_max_ttl: Duration,
    /// Period of the neighbour refresh and store expiry sweep.
    #[serde(with = "crate::config::duration_ms")]
    pub refresh_interval: Duration,
    pub delivery_channel_capacity: usize,
    pub duplicate: DuplicateDetectorConfig,
    pub router_duplicate: RouterDuplicateDetectorConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            routing_capacity: DEFAULT_ROUTING_CAPACITY,
            max_lookup_iterations: 20,
            per_query_timeout: Duration::from_secs(3),
            lookup_timeout: Duration::from_secs(10),
            redundancy_factor: DEFAULT_REDUNDANCY_FACTOR,
            store_default_ttl: Duration::from_secs(5 * 60),
            store_max_ttl: Duration::from_secs(24 * 60 * 60),
            refresh_interval: Duration::from_secs(60),
            delivery_channel_capacity: 256,
            duplicate: DuplicateDetectorConfig::default(),
            router_duplicate: RouterDuplicateDetectorConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeState {
    #[default]
    Created,
    Joining,
    Joined,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DhtError {
    #[error("failed to join overlay: none of {entry_points} entry points responded")]
    Join { entry_points: usize },
    #[error("node is stopped")]
    Stopped,
    #[error("a join is already in progress")]
    JoinInProgress,
    #[error("node has not joined an overlay")]
    NotJoined,
    #[error("routing failed: {0:?}")]
    Route(RouteFailure),
    #[error("node actor is no longer running")]
    ActorClosed,
}

#[derive(Clone, Debug, Default)]
pub struct DhtStats {
    pub state: NodeState,
    pub routing_contacts: usize,
    pub stored_keys: usize,
    /// Keys for which enough closer peers are known.
    pub stale_keys: usize,
    pub delivered_ids: usize,
}

pub struct LookupResult {
    pub closest: Vec<PeerIdentity>,
    /// Number of peers that answered at least one query.
    pub responded: usize,
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerIdentity,
    network: Arc<N>,
    config: Arc<DhtConfig>,
    shutdown: CancellationToken,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

enum RouteDecision {
    Deliver,
    Forward(Vec<PeerIdentity>),
    Reject(RouteFailure),
}

/// A replica push: the entry and the peer it goes to.
type Replica = (PeerIdentity, StoredRecordEntry);

#[derive(Default)]
struct Departure {
    neighbours: Vec<PeerIdentity>,
    handoff: Vec<Replica>,
}

struct Maintenance {
    state: NodeState,
    routing_empty: bool,
    entry_points: Vec<PeerIdentity>,
}

enum Command {
    // Lifecycle
    GetState(oneshot::Sender<NodeState>),
    BeginJoin(Vec<PeerIdentity>, oneshot::Sender<Result<Vec<PeerIdentity>, DhtError>>),
    FinishJoin(bool),
    Stop(oneshot::Sender<Departure>),

    // Routing state
    Observe(Vec<PeerIdentity>),
    RemoveContact(NodeId),
    Closest(NodeId, usize, oneshot::Sender<Vec<PeerIdentity>>),
    RoutingContacts(oneshot::Sender<Vec<PeerIdentity>>),

    // Local storage
    StoreLocal(StoredRecordEntry, oneshot::Sender<StoreOutcome>),
    GetLocal(NodeId, oneshot::Sender<Vec<StoredRecordEntry>>),
    DeleteLocal(NodeId, NodeId, oneshot::Sender<bool>),
    HandleStore(PeerIdentity, StoredRecordEntry, oneshot::Sender<bool>),
    HandleReplicate(PeerIdentity, StoredRecordEntry, oneshot::Sender<bool>),

    // Message routing
    Route {
        from: Option<PeerIdentity>,
        message: RoutedMessage,
        reply: oneshot::Sender<RouteDecision>,
    },

    // Maintenance
    Maintenance(oneshot::Sender<Maintenance>),
    Stats(oneshot::Sender<DhtStats>),
}

struct DhtNodeActor {
    local: PeerIdentity,
    config: Arc<DhtConfig>,
    state: NodeState,
    /// State to fall back to when the current join fails.
    state_before_join: NodeState,
    routing: ContactList,
    store: LocalDataStore,
    /// Request ids of messages delivered here.
    delivered: DuplicateDetector,
    /// Request ids of messages forwarded through here.
    forwarded: RouterDuplicateDetector,
    entry_points: Vec<PeerIdentity>,
    delivery_tx: mpsc::Sender<RoutedMessage>,
    replication_tx: mpsc::Sender<Replica>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl<N: DhtNodeRpc> DhtNode<N> {
    /// Spawn the node actor. The returned receiver yields every routed
    /// message addressed to this node.
    pub fn new(local: PeerIdentity, network: N, config: DhtConfig) -> (Self, mpsc::Receiver<RoutedMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_channel_capacity.max(1));
        let (replication_tx, replication_rx) = mpsc::channel(REPLICATION_QUEUE_CAPACITY);
        let config = Arc::new(config);

        let actor = DhtNodeActor {
            local: local.clone(),
            state: NodeState::Created,
            state_before_join: NodeState::Created,
            routing: ContactList::new(local.node_id, config.routing_capacity),
            store: LocalDataStore::new(config.store_max_ttl),
            delivered: DuplicateDetector::from_config(&config.duplicate),
            forwarded: RouterDuplicateDetector::from_config(config.router_duplicate.clone()),
            entry_points: Vec::new(),
            delivery_tx,
            replication_tx,
            cmd_rx,
            config: config.clone(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            local,
            network: Arc::new(network),
            config,
            shutdown: CancellationToken::new(),
        };
        node.spawn_periodic_refresh();
        node.spawn_replication(replication_rx);
        (node, delivery_rx)
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.node_id
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn state(&self) -> NodeState {
        self.request(Command::GetState).await.unwrap_or(NodeState::Stopped)
    }

    pub async fn stats(&self) -> DhtStats {
        self.request(Command::Stats).await.unwrap_or(DhtStats {
            state: NodeState::Stopped,
            ..DhtStats::default()
        })
    }

    /// Every contact in the routing list, closest to the local id first.
    pub async fn routing_contacts(&self) -> Vec<PeerIdentity> {
        self.request(Command::RoutingContacts).await.unwrap_or_default()
    }

    pub async fn observe_contact(&self, contact: PeerIdentity) {
        let _ = self.cmd_tx.send(Command::Observe(vec![contact])).await;
    }

    async fn observe_contacts(&self, contacts: Vec<PeerIdentity>) {
        if !contacts.is_empty() {
            let _ = self.cmd_tx.send(Command::Observe(contacts)).await;
        }
    }

    async fn remove_contact(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::RemoveContact(id)).await;
    }

    async fn ensure_joined(&self) -> Result<(), DhtError> {
        match self.state().await {
            NodeState::Joined => Ok(()),
            NodeState::Stopped => Err(DhtError::Stopped),
            NodeState::Created | NodeState::Joining => Err(DhtError::NotJoined),
        }
    }

    fn spawn_periodic_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(maintenance) = node.request(Command::Maintenance).await else {
                    break;
                };
                if maintenance.state != NodeState::Joined {
                    continue;
                }

                let seeds = if maintenance.routing_empty {
                    maintenance.entry_points
                } else {
                    Vec::new()
                };
                match node.lookup(node.local.node_id, seeds).await {
                    Ok(result) => trace!(
                        found = result.closest.len(),
                        responded = result.responded,
                        "neighbour refresh completed"
                    ),
                    Err(e) => debug!(error = %e, "neighbour refresh failed"),
                }
            }
        });
    }

    fn spawn_replication(&self, mut replicas: mpsc::Receiver<Replica>) {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let (peer, entry) = tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    replica = replicas.recv() => match replica {
                        Some(replica) => replica,
                        None => break,
                    },
                };
                let key = entry.key;
                let timeout = node.config.per_query_timeout;
                match tokio::time::timeout(timeout, node.network.replicate_data(&peer, entry)).await {
                    Ok(Ok(())) => trace!(
                        peer = ?hex::encode(&peer.node_id.as_bytes()[..8]),
                        key = ?hex::encode(&key.as_bytes()[..8]),
                        "replica sent"
                    ),
                    Ok(Err(e)) => debug!(
                        peer = ?hex::encode(&peer.node_id.as_bytes()[..8]),
                        error = %e,
                        "replication failed"
                    ),
                    Err(_) => debug!(peer = ?hex::encode(&peer.node_id.as_bytes()[..8]), "replication timed out"),
                }
            }
        });
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Join the overlay through `entry_points`.
    ///
    /// An empty list, or one naming only this node, starts a new overlay.
    pub async fn join(&self, entry_points: Vec<PeerIdentity>) -> Result<(), DhtError> {
        let seeds = self
            .request(|tx| Command::BeginJoin(entry_points, tx))
            .await
            .ok_or(DhtError::ActorClosed)??;

        if seeds.is_empty() {
            info!(
                node = ?hex::encode(&self.local.node_id.as_bytes()[..8]),
                "no entry points, starting new overlay"
            );
            return Ok(());
        }

        let seed_count = seeds.len();
        let result = self.lookup(self.local.node_id, seeds).await;
        let responded = result.as_ref().map(|r| r.responded).unwrap_or(0);
        let _ = self.cmd_tx.send(Command::FinishJoin(responded > 0)).await;

        if responded == 0 {
            warn!(entry_points = seed_count, "join failed, no entry point responded");
            return Err(DhtError::Join { entry_points: seed_count });
        }
        info!(
            node = ?hex::encode(&self.local.node_id.as_bytes()[..8]),
            responded,
            "joined overlay"
        );
        Ok(())
    }

    /// Leave the overlay. Stored entries are handed to the closest remaining
    /// contacts, then neighbours are told to forget this node. The node
    /// cannot be used afterwards.
    pub async fn stop(&self) {
        let departure = self.request(Command::Stop).await.unwrap_or_default();
        self.shutdown.cancel();

        let handed_off = departure.handoff.len();
        let mut join_set = JoinSet::new();
        for (peer, entry) in departure.handoff {
            let net = self.network.clone();
            let timeout = self.config.per_query_timeout;
            join_set.spawn(async move {
                if let Ok(Err(e)) = tokio::time::timeout(timeout, net.replicate_data(&peer, entry)).await {
                    trace!(peer = ?hex::encode(&peer.node_id.as_bytes()[..8]), error = %e, "hand-off failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        if handed_off > 0 {
            debug!(replicas = handed_off, "stored entries handed off");
        }
        if departure.neighbours.is_empty() {
            return;
        }

        let mut join_set = JoinSet::new();
        for peer in departure.neighbours {
            let net = self.network.clone();
            let timeout = self.config.per_query_timeout;
            join_set.spawn(async move {
                if let Ok(Err(e)) = tokio::time::timeout(timeout, net.leave_notice(&peer)).await {
                    trace!(peer = ?hex::encode(&peer.node_id.as_bytes()[..8]), error = %e, "leave notice failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        info!(node = ?hex::encode(&self.local.node_id.as_bytes()[..8]), "left overlay");
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// The k closest peers to `target`, ascending by distance. The local
    /// node takes part in the ranking.
    pub async fn find_closest_nodes_from_dht(&self, target: NodeId) -> Result<Vec<PeerIdentity>, DhtError> {
        let result = self.lookup(target, Vec::new()).await?;
        let mut ranked = ContactList::for_lookup(target, self.config.k);
        ranked.add_contacts(result.closest);
        ranked.add_contact(self.local.clone());
        Ok(ranked.get_all_contacts())
    }

    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<PeerIdentity>, DhtError> {
        Ok(self.lookup(target, Vec::new()).await?.closest)
    }

    async fn lookup(&self, target: NodeId, seeds: Vec<PeerIdentity>) -> Result<LookupResult, DhtError> {
        let k = self.config.k.max(1);
        let alpha = self.config.alpha.max(1);
        let lookup_start = Instant::now();

        let initial = self
            .request(|tx| Command::Closest(target, k, tx))
            .await
            .ok_or(DhtError::ActorClosed)?;

        let mut shortlist = ContactList::for_lookup(target, k);
        for peer in initial.into_iter().chain(seeds) {
            if peer.node_id != self.local.node_id {
                shortlist.add_contact(peer);
            }
        }

        let mut best_distance = shortlist.closest_distance();
        let mut failed: HashSet<NodeId> = HashSet::new();
        let mut responded = 0usize;
        let mut queried = 0usize;
        let mut iteration = 0;

        loop {
            iteration += 1;
            if iteration > self.config.max_lookup_iterations {
                warn!(
                    target = ?hex::encode(&target.as_bytes()[..8]),
                    iterations = iteration,
                    "iterative lookup exceeded max iterations"
                );
                break;
            }
            if lookup_start.elapsed() > self.config.lookup_timeout {
                debug!(
                    target = ?hex::encode(&target.as_bytes()[..8]),
                    elapsed_ms = lookup_start.elapsed().as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let candidates = shortlist.get_uncontacted_contacts(alpha);
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                shortlist.set_contacted(&c.node_id);
            }
            queried += candidates.len();

            let mut join_set = JoinSet::new();
            let candidates_len = candidates.len();
            for (idx, contact) in candidates.into_iter().enumerate() {
                let net = self.network.clone();
                let timeout = self.config.per_query_timeout;
                join_set.spawn(async move {
                    let result = match tokio::time::timeout(timeout, net.find_closest_nodes(&contact, target, k)).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow::anyhow!("query timeout")),
                    };
                    (idx, contact, result)
                });
            }

            type FindQueryResult = (PeerIdentity, anyhow::Result<Vec<PeerIdentity>>);

            let mut results: Vec<Option<FindQueryResult>> = Vec::with_capacity(candidates_len);
            results.resize_with(candidates_len, || None);
            while let Some(joined) = join_set.join_next().await {
                if let Ok((idx, contact, result)) = joined {
                    results[idx] = Some((contact, result));
                }
            }

            let results: Vec<FindQueryResult> = results.into_iter().flatten().collect();
            for (contact, result) in &results {
                if let Err(e) = result {
                    trace!(
                        peer = ?hex::encode(&contact.node_id.as_bytes()[..8]),
                        error = %e,
                        "lookup query failed"
                    );
                    failed.insert(contact.node_id);
                    shortlist.remove_contact(&contact.node_id);
                    self.remove_contact(contact.node_id).await;
                }
            }
            for (contact, result) in results {
                let Ok(nodes) = result else {
                    continue;
                };
                responded += 1;
                let mut observed = Vec::with_capacity(nodes.len() + 1);
                observed.push(contact);
                for n in nodes {
                    if n.node_id == self.local.node_id || failed.contains(&n.node_id) {
                        continue;
                    }
                    // keep the contacted flag of peers already queried
                    if !shortlist.contains(&n.node_id) {
                        shortlist.add_contact(n.clone());
                    }
                    observed.push(n);
                }
                self.observe_contacts(observed).await;
            }

            let new_best = shortlist.closest_distance();
            let closer = match (&new_best, &best_distance) {
                (Some(new), Some(old)) => distance_cmp(new, old) == std::cmp::Ordering::Less,
                (Some(_), None) => true,
                _ => false,
            };
            if !closer {
                break;
            }
            best_distance = new_best;
        }

        debug!(
            target = ?hex::encode(&target.as_bytes()[..8]),
            found = shortlist.len(),
            queried,
            responded,
            "iterative lookup completed"
        );

        Ok(LookupResult {
            closest: shortlist.get_all_contacts(),
            responded,
        })
    }

    // ========================================================================
    // Storage
    // ========================================================================

    async fn store_local(&self, entry: StoredRecordEntry) -> StoreOutcome {
        self.request(|tx| Command::StoreLocal(entry, tx))
            .await
            .unwrap_or(StoreOutcome::Full)
    }

    async fn get_local(&self, key: NodeId) -> Vec<StoredRecordEntry> {
        self.request(|tx| Command::GetLocal(key, tx)).await.unwrap_or_default()
    }

    /// Store `value` under `key` as this node's entry. Returns the peers
    /// that accepted it, at most `redundancy_factor` of them.
    pub async fn store_value(&self, key: NodeId, value: Vec<u8>) -> Result<Vec<PeerIdentity>, DhtError> {
        self.ensure_joined().await?;
        let entry = StoredRecordEntry::new(key, value, self.local.node_id, self.config.store_default_ttl);
        let closest = self.find_closest_nodes_from_dht(key).await?;
        let wanted = self.config.redundancy_factor.max(1);

        let mut holders: Vec<PeerIdentity> = Vec::with_capacity(wanted);
        let mut remaining = closest.into_iter();
        while holders.len() < wanted {
            let batch: Vec<PeerIdentity> = remaining.by_ref().take(wanted - holders.len()).collect();
            if batch.is_empty() {
                break;
            }

            let mut join_set = JoinSet::new();
            for peer in batch {
                if peer.node_id == self.local.node_id {
                    if self.store_local(entry.clone()).await == StoreOutcome::Stored {
                        holders.push(peer);
                    }
                    continue;
                }
                let net = self.network.clone();
                let entry = entry.clone();
                let timeout = self.config.per_query_timeout;
                join_set.spawn(async move {
                    let result = tokio::time::timeout(timeout, net.store_data(&peer, entry)).await;
                    (peer, result)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((peer, Ok(Ok(true)))) => holders.push(peer),
                    Ok((peer, Ok(Ok(false)))) => {
                        trace!(peer = ?hex::encode(&peer.node_id.as_bytes()[..8]), "store refused");
                    }
                    Ok((peer, Ok(Err(e)))) => {
                        debug!(peer = ?hex::encode(&peer.node_id.as_bytes()[..8]), error = %e, "store failed");
                    }
                    Ok((peer, Err(_))) => {
                        debug!(peer = ?hex::encode(&peer.node_id.as_bytes()[..8]), "store timed out");
                    }
                    Err(e) => warn!(error = %e, "store task failed"),
                }
            }
        }

        debug!(
            key = ?hex::encode(&key.as_bytes()[..8]),
            holders = holders.len(),
            wanted,
            "store completed"
        );
        Ok(holders)
    }

    /// Every creator's entry under `key` as seen by the closest nodes.
    /// The newest entry per creator wins; deleted entries are included.
    pub async fn fetch_value(&self, key: NodeId) -> Result<Vec<StoredRecordEntry>, DhtError> {
        self.ensure_joined().await?;
        let closest = self.find_closest_nodes_from_dht(key).await?;

        let mut merged: HashMap<NodeId, StoredRecordEntry> = HashMap::new();
        let mut join_set = JoinSet::new();
        for peer in closest {
            if peer.node_id == self.local.node_id {
                merge_entries(&mut merged, self.get_local(key).await);
                continue;
            }
            let net = self.network.clone();
            let timeout = self.config.per_query_timeout;
            join_set.spawn(async move { tokio::time::timeout(timeout, net.find_data(&peer, key)).await });
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Ok(Ok(entries))) = joined {
                merge_entries(&mut merged, entries);
            }
        }

        let mut entries: Vec<StoredRecordEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.creator.as_bytes().cmp(b.creator.as_bytes()))
        });
        trace!(key = ?hex::encode(&key.as_bytes()[..8]), entries = entries.len(), "fetch completed");
        Ok(entries)
    }

    /// Mark this node's entry under `key` deleted on the closest nodes.
    /// Without `wait_for_completion` the work continues in the background.
    pub async fn delete_value(&self, key: NodeId, wait_for_completion: bool) -> Result<(), DhtError> {
        self.ensure_joined().await?;
        if wait_for_completion {
            return self.delete_everywhere(key).await;
        }
        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.delete_everywhere(key).await {
                debug!(key = ?hex::encode(&key.as_bytes()[..8]), error = %e, "background delete failed");
            }
        });
        Ok(())
    }

    async fn delete_everywhere(&self, key: NodeId) -> Result<(), DhtError> {
        let creator = self.local.node_id;
        let closest = self.find_closest_nodes_from_dht(key).await?;

        let mut deleted = 0usize;
        let mut join_set = JoinSet::new();
        for peer in closest {
            if peer.node_id == creator {
                if self.request(|tx| Command::DeleteLocal(key, creator, tx)).await.unwrap_or(false) {
                    deleted += 1;
                }
                continue;
            }
            let net = self.network.clone();
            let timeout = self.config.per_query_timeout;
            join_set.spawn(async move { tokio::time::timeout(timeout, net.delete_data(&peer, key, creator)).await });
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Ok(Ok(true))) = joined {
                deleted += 1;
            }
        }
        debug!(key = ?hex::encode(&key.as_bytes()[..8]), deleted, "delete completed");
        Ok(())
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route `payload` to the peer whose id is `target`.
    pub async fn route_message(&self, target: NodeId, payload: Vec<u8>) -> Result<(), DhtError> {
        self.ensure_joined().await?;
        let message = RoutedMessage::new(self.local.clone(), target, payload);
        let ack = self.route(None, message).await;
        match ack.error {
            None => Ok(()),
            Some(failure) => Err(DhtError::Route(failure)),
        }
    }

    async fn route(&self, from: Option<PeerIdentity>, mut message: RoutedMessage) -> RouteAck {
        let origin = from.is_none();
        let request_id = message.request_id.clone();
        let decision = self
            .request(|reply| Command::Route {
                from,
                message: message.clone(),
                reply,
            })
            .await
            .unwrap_or(RouteDecision::Reject(RouteFailure::NotJoined));

        let candidates = match decision {
            RouteDecision::Deliver => return RouteAck::ok(),
            RouteDecision::Reject(failure) => return RouteAck::failed(failure),
            RouteDecision::Forward(candidates) => candidates,
        };

        if !origin {
            message.routing_path.push(self.local.clone());
        }
        if message.routing_path.len() > MAX_ROUTING_HOPS {
            debug!(request_id = %request_id, hops = message.routing_path.len(), "routing path too long, dropping");
            return RouteAck::failed(RouteFailure::NoCandidates);
        }

        let parallelism = if origin {
            ORIGIN_ROUTING_PARALLELISM
        } else {
            FORWARD_ROUTING_PARALLELISM
        };

        let mut failed_hops = 0usize;
        for batch in candidates.chunks(parallelism) {
            let mut join_set = JoinSet::new();
            for peer in batch.iter().cloned() {
                let net = self.network.clone();
                let message = message.clone();
                join_set.spawn(async move {
                    let result = net.route_message(&peer, message).await;
                    (peer, result)
                });
            }

            let mut delivered = false;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((_, Ok(ack))) if ack.is_ok() => delivered = true,
                    Ok((peer, Ok(ack))) => {
                        failed_hops += 1;
                        trace!(
                            request_id = %request_id,
                            peer = ?hex::encode(&peer.node_id.as_bytes()[..8]),
                            reason = ?ack.error,
                            "next hop declined"
                        );
                    }
                    Ok((peer, Err(e))) => {
                        failed_hops += 1;
                        debug!(
                            request_id = %request_id,
                            peer = ?hex::encode(&peer.node_id.as_bytes()[..8]),
                            error = %e,
                            "next hop unreachable"
                        );
                    }
                    Err(e) => {
                        failed_hops += 1;
                        warn!(error = %e, "routing task failed");
                    }
                }
            }
            if delivered {
                return RouteAck::ok();
            }
            if failed_hops >= MAX_FAILED_HOPS {
                debug!(request_id = %request_id, failed_hops, "giving up on routed message");
                break;
            }
        }

        debug!(
            request_id = %request_id,
            target = ?hex::encode(&message.target.as_bytes()[..8]),
            "no next hop accepted routed message"
        );
        RouteAck::failed(RouteFailure::NoCandidates)
    }

    // ========================================================================
    // Inbound request handlers
    // ========================================================================

    pub async fn handle_ping(&self, from: PeerIdentity) {
        self.observe_contact(from).await;
    }

    pub async fn handle_find_closest_nodes(&self, from: PeerIdentity, target: NodeId, limit: usize) -> Vec<PeerIdentity> {
        self.observe_contact(from).await;
        self.request(|tx| Command::Closest(target, limit, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_store_data(&self, from: PeerIdentity, entry: StoredRecordEntry) -> bool {
        self.request(|tx| Command::HandleStore(from, entry, tx))
            .await
            .unwrap_or(false)
    }

    pub async fn handle_find_data(&self, from: PeerIdentity, key: NodeId) -> Vec<StoredRecordEntry> {
        self.observe_contact(from).await;
        self.get_local(key).await
    }

    /// Only the creator of an entry may delete it.
    pub async fn handle_delete_data(&self, from: PeerIdentity, key: NodeId, creator: NodeId) -> bool {
        let allowed = from.node_id == creator;
        self.observe_contact(from).await;
        if !allowed {
            return false;
        }
        self.request(|tx| Command::DeleteLocal(key, creator, tx))
            .await
            .unwrap_or(false)
    }

    pub async fn handle_route_message(&self, from: PeerIdentity, message: RoutedMessage) -> RouteAck {
        self.route(Some(from), message).await
    }

    pub async fn handle_leave_notice(&self, from: PeerIdentity) {
        self.remove_contact(from.node_id).await;
    }

    /// Accept a replica pushed by `from`. The sender is not added to the
    /// routing list since it may be on its way out.
    pub async fn handle_replicate_data(&self, from: PeerIdentity, entry: StoredRecordEntry) -> bool {
        self.request(|tx| Command::HandleReplicate(from, entry, tx))
            .await
            .unwrap_or(false)
    }
}

/// Keep the newest entry per creator. On equal timestamps a deletion wins.
fn merge_entries(merged: &mut HashMap<NodeId, StoredRecordEntry>, entries: Vec<StoredRecordEntry>) {
    for entry in entries {
        match merged.get(&entry.creator) {
            Some(existing)
                if existing.created_at > entry.created_at
                    || (existing.created_at == entry.created_at && (existing.deleted || !entry.deleted)) => {}
            _ => {
                merged.insert(entry.creator, entry);
            }
        }
    }
}

#[async_trait::async_trait]
impl<N: DhtNodeRpc> DhtStorage for DhtNode<N> {
    async fn fetch_data_from_dht(&self, key: NodeId) -> anyhow::Result<Vec<StoredRecordEntry>> {
        Ok(self.fetch_value(key).await?)
    }

    async fn store_data_to_dht(&self, key: NodeId, value: Vec<u8>) -> anyhow::Result<Vec<PeerIdentity>> {
        Ok(self.store_value(key, value).await?)
    }

    async fn delete_data_from_dht(&self, key: NodeId, wait_for_completion: bool) -> anyhow::Result<()> {
        Ok(self.delete_value(key, wait_for_completion).await?)
    }
}

impl DhtNodeActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::GetState(reply) => {
                    let _ = reply.send(self.state);
                }
                Command::BeginJoin(entry_points, reply) => {
                    let _ = reply.send(self.begin_join(entry_points));
                }
                Command::FinishJoin(success) => {
                    if self.state == NodeState::Joining {
                        self.state = if success {
                            NodeState::Joined
                        } else {
                            self.state_before_join
                        };
                    }
                }
                Command::Stop(reply) => {
                    self.state = NodeState::Stopped;
                    let _ = reply.send(self.departure());
                    break;
                }
                Command::Observe(contacts) => {
                    for contact in contacts {
                        self.observe(contact);
                    }
                }
                Command::RemoveContact(id) => {
                    if self.routing.remove_contact(&id) {
                        trace!(peer = ?hex::encode(&id.as_bytes()[..8]), "contact removed");
                    }
                }
                Command::Closest(target, limit, reply) => {
                    let _ = reply.send(self.closest_to(&target, limit));
                }
                Command::RoutingContacts(reply) => {
                    let _ = reply.send(self.routing.get_all_contacts());
                }
                Command::StoreLocal(entry, reply) => {
                    let _ = reply.send(self.store.store(entry));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key));
                }
                Command::DeleteLocal(key, creator, reply) => {
                    let _ = reply.send(self.store.mark_deleted(&key, &creator));
                }
                Command::HandleStore(from, entry, reply) => {
                    let _ = reply.send(self.handle_store(from, entry));
                }
                Command::HandleReplicate(from, entry, reply) => {
                    let _ = reply.send(self.handle_replicate(from, entry));
                }
                Command::Route { from, message, reply } => {
                    let _ = reply.send(self.decide_route(from, &message));
                }
                Command::Maintenance(reply) => {
                    let expired = self.store.remove_expired();
                    if expired > 0 {
                        trace!(expired, "expired stored entries removed");
                    }
                    let _ = reply.send(Maintenance {
                        state: self.state,
                        routing_empty: self.routing.is_empty(),
                        entry_points: self.entry_points.clone(),
                    });
                }
                Command::Stats(reply) => {
                    let _ = reply.send(DhtStats {
                        state: self.state,
                        routing_contacts: self.routing.len(),
                        stored_keys: self.store.key_count(),
                        stale_keys: self.store.stale_key_count(),
                        delivered_ids: self.delivered.len(),
                    });
                }
            }
        }
    }

    fn begin_join(&mut self, entry_points: Vec<PeerIdentity>) -> Result<Vec<PeerIdentity>, DhtError> {
        match self.state {
            NodeState::Stopped => return Err(DhtError::Stopped),
            NodeState::Joining => return Err(DhtError::JoinInProgress),
            NodeState::Created | NodeState::Joined => {}
        }

        let seeds: Vec<PeerIdentity> = entry_points
            .into_iter()
            .filter(|p| p.node_id != self.local.node_id)
            .collect();
        if seeds.is_empty() {
            self.state = NodeState::Joined;
            return Ok(seeds);
        }
        self.entry_points = seeds.clone();
        self.state_before_join = self.state;
        self.state = NodeState::Joining;
        Ok(seeds)
    }

    /// Every stored entry paired with the closest remaining contacts to its key.
    fn departure(&mut self) -> Departure {
        let wanted = self.config.redundancy_factor.max(1);
        let mut handoff = Vec::new();
        for entry in self.store.entries() {
            for peer in self.closest_to(&entry.key, wanted) {
                handoff.push((peer, entry.clone()));
            }
        }
        Departure {
            neighbours: self.routing.get_closest_contacts(self.config.k),
            handoff,
        }
    }

    fn observe(&mut self, contact: PeerIdentity) {
        if contact.node_id == self.local.node_id || self.state == NodeState::Stopped {
            return;
        }
        let known = self.routing.contains(&contact.node_id);
        if self.routing.add_contact(contact.clone()) && !known {
            self.on_new_contact(&contact);
        }
    }

    fn on_new_contact(&mut self, contact: &PeerIdentity) {
        for key in self.store.keys() {
            self.refresh_stale(&key);
            if !self.should_replicate_to(&key, &contact.node_id) {
                continue;
            }
            for entry in self.store.get(&key) {
                if let Err(e) = self.replication_tx.try_send((contact.clone(), entry)) {
                    debug!(
                        peer = ?hex::encode(&contact.node_id.as_bytes()[..8]),
                        error = %e,
                        "replica dropped"
                    );
                }
            }
        }
    }

    /// Routing contacts other than `exclude` closer to `key` than
    /// `distance`, counted up to the redundancy factor.
    fn count_closer(&self, key: &NodeId, distance: &Distance, exclude: Option<&NodeId>) -> usize {
        self.routing
            .entries()
            .iter()
            .filter(|e| Some(&e.identity.node_id) != exclude)
            .filter(|e| distance_cmp(&e.identity.node_id.xor_distance(key), distance) == std::cmp::Ordering::Less)
            .take(self.config.redundancy_factor)
            .count()
    }

    /// Stale once enough known peers sit closer to the key than we do.
    fn refresh_stale(&mut self, key: &NodeId) {
        let own = self.local.node_id.xor_distance(key);
        let stale = self.count_closer(key, &own, None) >= self.config.redundancy_factor;
        self.store.set_stale(key, stale);
    }

    /// True when this node is the closest holder of `key` it knows of and
    /// `newcomer` ranks among the `redundancy_factor` closest.
    fn should_replicate_to(&self, key: &NodeId, newcomer: &NodeId) -> bool {
        let own = self.local.node_id.xor_distance(key);
        if self.count_closer(key, &own, Some(newcomer)) > 0 {
            return false;
        }
        let theirs = newcomer.xor_distance(key);
        let mut ahead = self.count_closer(key, &theirs, Some(newcomer));
        if distance_cmp(&own, &theirs) == std::cmp::Ordering::Less {
            ahead += 1;
        }
        ahead < self.config.redundancy_factor
    }

    fn closest_to(&self, target: &NodeId, limit: usize) -> Vec<PeerIdentity> {
        if *target == self.local.node_id {
            return self.routing.get_closest_contacts(limit);
        }
        let mut ranked = ContactList::for_lookup(*target, limit);
        ranked.add_contacts(self.routing.get_all_contacts());
        ranked.get_all_contacts()
    }

    fn handle_store(&mut self, from: PeerIdentity, entry: StoredRecordEntry) -> bool {
        if from.node_id != entry.creator {
            debug!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                "rejecting store for an entry created by another node"
            );
            return false;
        }
        self.observe(from);

        let key = entry.key;
        let outcome = self.store.store(entry);
        if outcome != StoreOutcome::Stored {
            trace!(key = ?hex::encode(&key.as_bytes()[..8]), outcome = ?outcome, "store not accepted");
            return false;
        }
        self.refresh_stale(&key);
        true
    }

    /// Replicas are kept only while this node is among the closest to the
    /// key, leaving the sender out of the ranking.
    fn handle_replicate(&mut self, from: PeerIdentity, entry: StoredRecordEntry) -> bool {
        let key = entry.key;
        let own = self.local.node_id.xor_distance(&key);
        if self.count_closer(&key, &own, Some(&from.node_id)) >= self.config.redundancy_factor {
            trace!(key = ?hex::encode(&key.as_bytes()[..8]), "replica ignored, closer holders known");
            return false;
        }
        let outcome = self.store.store(entry);
        if outcome != StoreOutcome::Stored {
            trace!(key = ?hex::encode(&key.as_bytes()[..8]), outcome = ?outcome, "replica not accepted");
            return false;
        }
        self.refresh_stale(&key);
        true
    }

    fn decide_route(&mut self, from: Option<PeerIdentity>, message: &RoutedMessage) -> RouteDecision {
        if self.state != NodeState::Joined {
            return RouteDecision::Reject(RouteFailure::NotJoined);
        }
        let from_id = from.as_ref().map(|p| p.node_id);
        if let Some(from) = from {
            self.observe(from);
        }

        if message.target == self.local.node_id {
            if self.delivered.is_likely_duplicate(&message.request_id) {
                trace!(request_id = %message.request_id, "duplicate delivery suppressed");
                return RouteDecision::Reject(RouteFailure::Duplicate);
            }
            self.delivered
                .add(message.request_id.clone(), message.source.node_id, None);
            if let Err(e) = self.delivery_tx.try_send(message.clone()) {
                warn!(request_id = %message.request_id, error = %e, "routed message dropped, delivery channel unavailable");
            }
            return RouteDecision::Deliver;
        }

        if from_id.is_some() && self.forwarded.test(&message.request_id) {
            trace!(request_id = %message.request_id, "duplicate forward suppressed");
            return RouteDecision::Reject(RouteFailure::Duplicate);
        }
        self.forwarded.add(&message.request_id);

        // forwarding hops only move strictly closer than the previous hop
        let limit = from_id.map(|id| id.xor_distance(&message.target));
        let candidates: Vec<PeerIdentity> = self
            .closest_to(&message.target, self.routing.len())
            .into_iter()
            .filter(|p| Some(p.node_id) != from_id && !message.has_visited(&p.node_id))
            .filter(|p| match &limit {
                Some(limit) => {
                    distance_cmp(&p.node_id.xor_distance(&message.target), limit) == std::cmp::Ordering::Less
                }
                None => true,
            })
            .take(ROUTING_CANDIDATES)
            .collect();
        if candidates.is_empty() {
            return RouteDecision::Reject(RouteFailure::NoCandidates);
        }
        RouteDecision::Forward(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, RwLock};
    use tokio::time::sleep;

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        local: PeerIdentity,
        latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
        failures: Arc<Mutex<HashSet<NodeId>>>,
        leave_notices: Arc<Mutex<Vec<NodeId>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, local: PeerIdentity) -> Self {
            Self {
                registry,
                local,
                latencies: Arc::new(Mutex::new(HashMap::new())),
                failures: Arc::new(Mutex::new(HashSet::new())),
                leave_notices: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn set_failure(&self, node: NodeId, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail {
                failures.insert(node);
            } else {
                failures.remove(&node);
            }
        }

        async fn set_latency(&self, node: NodeId, latency: Duration) {
            self.latencies.lock().await.insert(node, latency);
        }

        async fn peer(&self, to: &PeerIdentity) -> anyhow::Result<DhtNode<TestNetwork>> {
            if self.failures.lock().await.contains(&to.node_id) {
                return Err(anyhow!("injected network failure"));
            }
            if let Some(delay) = self.latencies.lock().await.get(&to.node_id).copied() {
                sleep(delay).await;
            }
            self.registry
                .get(&to.node_id)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<NodeId, DhtNode<TestNetwork>>>,
        route_calls: AtomicUsize,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.local_id(), node.clone());
        }

        async fn get(&self, id: &NodeId) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }
    }

    #[async_trait::async_trait]
    impl DhtNodeRpc for TestNetwork {
        async fn ping(&self, to: &PeerIdentity) -> anyhow::Result<()> {
            self.peer(to).await?.handle_ping(self.local.clone()).await;
            Ok(())
        }

        async fn find_closest_nodes(&self, to: &PeerIdentity, target: NodeId, limit: usize) -> anyhow::Result<Vec<PeerIdentity>> {
            Ok(self.peer(to).await?.handle_find_closest_nodes(self.local.clone(), target, limit).await)
        }

        async fn store_data(&self, to: &PeerIdentity, entry: StoredRecordEntry) -> anyhow::Result<bool> {
            Ok(self.peer(to).await?.handle_store_data(self.local.clone(), entry).await)
        }

        async fn find_data(&self, to: &PeerIdentity, key: NodeId) -> anyhow::Result<Vec<StoredRecordEntry>> {
            Ok(self.peer(to).await?.handle_find_data(self.local.clone(), key).await)
        }

        async fn delete_data(&self, to: &PeerIdentity, key: NodeId, creator: NodeId) -> anyhow::Result<bool> {
            Ok(self.peer(to).await?.handle_delete_data(self.local.clone(), key, creator).await)
        }

        async fn route_message(&self, to: &PeerIdentity, message: RoutedMessage) -> anyhow::Result<RouteAck> {
            self.registry.route_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.peer(to).await?.handle_route_message(self.local.clone(), message).await)
        }

        async fn leave_notice(&self, to: &PeerIdentity) -> anyhow::Result<()> {
            self.leave_notices.lock().await.push(to.node_id);
            self.peer(to).await?.handle_leave_notice(self.local.clone()).await;
            Ok(())
        }

        async fn replicate_data(&self, to: &PeerIdentity, entry: StoredRecordEntry) -> anyhow::Result<()> {
            self.peer(to).await?.handle_replicate_data(self.local.clone(), entry).await;
            Ok(())
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
        delivered: mpsc::Receiver<RoutedMessage>,
    }

    impl TestNode {
        async fn new(registry: &Arc<NetworkRegistry>, config: DhtConfig) -> Self {
            Self::with_id(registry, NodeId::random(), config).await
        }

        async fn with_id(registry: &Arc<NetworkRegistry>, id: NodeId, config: DhtConfig) -> Self {
            let local = PeerIdentity::bare(id);
            let network = TestNetwork::new(registry.clone(), local.clone());
            let (node, delivered) = DhtNode::new(local, network.clone(), config);
            registry.register(&node).await;
            Self { node, network, delivered }
        }

        fn identity(&self) -> PeerIdentity {
            self.node.local().clone()
        }
    }

    fn test_config() -> DhtConfig {
        DhtConfig {
            redundancy_factor: 3,
            ..DhtConfig::default()
        }
    }

    /// First node starts the overlay, every other node joins through it.
    async fn overlay(registry: &Arc<NetworkRegistry>, size: usize) -> Vec<TestNode> {
        let mut nodes = Vec::with_capacity(size);
        let first = TestNode::new(registry, test_config()).await;
        first.node.join(Vec::new()).await.unwrap();
        let entry = first.identity();
        nodes.push(first);
        for _ in 1..size {
            let node = TestNode::new(registry, test_config()).await;
            node.node.join(vec![entry.clone()]).await.unwrap();
            nodes.push(node);
        }
        nodes
    }

    #[tokio::test]
    async fn empty_entry_points_start_new_overlay() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(&registry, test_config()).await;
        assert_eq!(node.node.state().await, NodeState::Created);

        node.node.join(Vec::new()).await.unwrap();
        assert_eq!(node.node.state().await, NodeState::Joined);
    }

    #[tokio::test]
    async fn self_only_entry_point_starts_new_overlay() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(&registry, test_config()).await;
        node.node.join(vec![node.identity()]).await.unwrap();
        assert_eq!(node.node.state().await, NodeState::Joined);
    }

    #[tokio::test]
    async fn join_fails_when_no_entry_point_responds() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(&registry, test_config()).await;
        let ghost = PeerIdentity::bare(NodeId::random());

        let err = node.node.join(vec![ghost]).await.unwrap_err();
        assert_eq!(err, DhtError::Join { entry_points: 1 });
        assert_eq!(node.node.state().await, NodeState::Created);
        assert!(node.node.routing_contacts().await.is_empty());
    }

    #[tokio::test]
    async fn stopped_node_cannot_join() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(&registry, test_config()).await;
        node.node.stop().await;
        assert_eq!(node.node.state().await, NodeState::Stopped);
        assert!(node.node.join(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn joined_node_may_rejoin() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 3).await;
        nodes[2].node.join(vec![nodes[1].identity()]).await.unwrap();
        assert_eq!(nodes[2].node.state().await, NodeState::Joined);
    }

    #[tokio::test]
    async fn failed_rejoin_keeps_node_joined() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 3).await;
        let ghost = PeerIdentity::bare(NodeId::random());
        for peer in &nodes[..2] {
            nodes[2].network.set_failure(peer.node.local_id(), true).await;
        }

        let err = nodes[2].node.join(vec![ghost]).await.unwrap_err();
        assert_eq!(err, DhtError::Join { entry_points: 1 });
        assert_eq!(nodes[2].node.state().await, NodeState::Joined);
        assert!(nodes[2].node.store_value(NodeId::random(), b"v".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn join_populates_routing_on_both_sides() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 2).await;
        let a = nodes[0].node.routing_contacts().await;
        let b = nodes[1].node.routing_contacts().await;
        assert!(a.iter().any(|p| p.node_id == nodes[1].node.local_id()));
        assert!(b.iter().any(|p| p.node_id == nodes[0].node.local_id()));
    }

    #[tokio::test]
    async fn closest_nodes_match_global_ranking() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 12).await;
        let target = NodeId::random();

        // the most recent joiner learned about everyone through the entry point
        let found = nodes[11].node.find_closest_nodes_from_dht(target).await.unwrap();
        assert_eq!(found.len(), 12);
        for pair in found.windows(2) {
            let da = pair[0].node_id.xor_distance(&target);
            let db = pair[1].node_id.xor_distance(&target);
            assert_eq!(distance_cmp(&da, &db), std::cmp::Ordering::Less);
        }

        let mut all: Vec<NodeId> = nodes.iter().map(|n| n.node.local_id()).collect();
        all.sort_by(|a, b| distance_cmp(&a.xor_distance(&target), &b.xor_distance(&target)));
        assert_eq!(found[0].node_id, all[0]);
    }

    #[tokio::test]
    async fn store_then_fetch_from_another_node() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 8).await;
        let key = NodeId::derive(b"some record");

        let holders = nodes[7].node.store_value(key, b"value".to_vec()).await.unwrap();
        assert_eq!(holders.len(), 3);

        let entries = nodes[0].node.fetch_value(key).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"value");
        assert_eq!(entries[0].creator, nodes[7].node.local_id());
        assert!(!entries[0].deleted);
    }

    #[tokio::test]
    async fn newer_store_from_same_creator_wins() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 6).await;
        let key = NodeId::derive(b"versioned");

        nodes[5].node.store_value(key, b"v1".to_vec()).await.unwrap();
        sleep(Duration::from_millis(5)).await;
        nodes[5].node.store_value(key, b"v2".to_vec()).await.unwrap();

        let entries = nodes[0].node.fetch_value(key).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"v2");
    }

    #[tokio::test]
    async fn entries_from_several_creators_are_merged() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 6).await;
        let key = NodeId::derive(b"shared");

        nodes[4].node.store_value(key, b"four".to_vec()).await.unwrap();
        nodes[5].node.store_value(key, b"five".to_vec()).await.unwrap();

        let mut values: Vec<Vec<u8>> = nodes[0]
            .node
            .fetch_value(key)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        values.sort();
        assert_eq!(values, vec![b"five".to_vec(), b"four".to_vec()]);
    }

    #[tokio::test]
    async fn deleted_entries_are_reported_as_deleted() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 6).await;
        let key = NodeId::derive(b"to delete");

        nodes[5].node.store_value(key, b"x".to_vec()).await.unwrap();
        nodes[5].node.delete_value(key, true).await.unwrap();

        let entries = nodes[0].node.fetch_value(key).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].deleted);
    }

    #[tokio::test]
    async fn only_creator_may_delete() {
        let registry = Arc::new(NetworkRegistry::default());
        let holder = TestNode::new(&registry, test_config()).await;
        let creator = PeerIdentity::bare(NodeId::random());
        let intruder = PeerIdentity::bare(NodeId::random());
        let key = NodeId::random();

        let entry = StoredRecordEntry::new(key, b"v".to_vec(), creator.node_id, Duration::from_secs(60));
        assert!(holder.node.handle_store_data(creator.clone(), entry).await);
        assert!(!holder.node.handle_delete_data(intruder, key, creator.node_id).await);
        assert!(holder.node.handle_delete_data(creator.clone(), key, creator.node_id).await);
        assert!(holder.node.handle_find_data(creator, key).await[0].deleted);
    }

    #[tokio::test]
    async fn store_for_foreign_creator_is_refused() {
        let registry = Arc::new(NetworkRegistry::default());
        let holder = TestNode::new(&registry, test_config()).await;
        let sender = PeerIdentity::bare(NodeId::random());
        let entry = StoredRecordEntry::new(NodeId::random(), b"v".to_vec(), NodeId::random(), Duration::from_secs(60));
        assert!(!holder.node.handle_store_data(sender, entry).await);
    }

    #[tokio::test]
    async fn store_is_marked_stale_when_closer_peers_are_known() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            redundancy_factor: 1,
            ..DhtConfig::default()
        };
        let holder = TestNode::new(&registry, config).await;
        let closer = PeerIdentity::bare(NodeId::random());
        holder.node.handle_ping(closer.clone()).await;

        // the known peer's own id is at distance zero from the key
        let key = closer.node_id;
        let creator = PeerIdentity::bare(NodeId::random());
        let entry = StoredRecordEntry::new(key, b"v".to_vec(), creator.node_id, Duration::from_secs(60));
        assert!(holder.node.handle_store_data(creator.clone(), entry).await);
        assert!(holder.node.handle_find_data(creator, key).await[0].stale);
    }

    /// An id differing from `id` only in the lowest bit.
    fn neighbour_of(id: NodeId) -> NodeId {
        let mut bytes = *id.as_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        NodeId::from_bytes(bytes)
    }

    async fn wait_for_stored_keys(node: &DhtNode<TestNetwork>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while node.stats().await.stored_keys < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replica arrives");
    }

    #[tokio::test]
    async fn new_closer_contact_receives_replica() {
        let registry = Arc::new(NetworkRegistry::default());
        let holder = TestNode::new(&registry, test_config()).await;
        let newcomer = TestNode::new(&registry, test_config()).await;
        let key = neighbour_of(newcomer.node.local_id());

        let entry = StoredRecordEntry::new(key, b"v".to_vec(), holder.node.local_id(), Duration::from_secs(60));
        assert!(holder.node.handle_store_data(holder.identity(), entry).await);
        assert_eq!(newcomer.node.stats().await.stored_keys, 0);

        holder.node.handle_ping(newcomer.identity()).await;
        wait_for_stored_keys(&newcomer.node, 1).await;

        let replicas = newcomer.node.handle_find_data(holder.identity(), key).await;
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].value, b"v");
        assert_eq!(replicas[0].creator, holder.node.local_id());
    }

    #[tokio::test]
    async fn replica_is_refused_when_closer_holders_are_known() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            redundancy_factor: 1,
            ..DhtConfig::default()
        };
        let receiver = TestNode::new(&registry, config).await;
        let known = PeerIdentity::bare(NodeId::random());
        receiver.node.handle_ping(known.clone()).await;
        let key = neighbour_of(known.node_id);
        let entry = StoredRecordEntry::new(key, b"v".to_vec(), known.node_id, Duration::from_secs(60));

        // the known contact sits next to the key and outranks us
        let other = PeerIdentity::bare(NodeId::random());
        assert!(!receiver.node.handle_replicate_data(other.clone(), entry.clone()).await);
        assert_eq!(receiver.node.stats().await.stored_keys, 0);

        // the sender of a replica is left out of the ranking
        assert!(receiver.node.handle_replicate_data(known, entry).await);
        assert_eq!(receiver.node.stats().await.stored_keys, 1);
        assert!(!receiver.node.routing_contacts().await.iter().any(|p| p.node_id == other.node_id));
    }

    #[tokio::test]
    async fn stale_flag_follows_new_contacts() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            redundancy_factor: 1,
            ..DhtConfig::default()
        };
        let holder = TestNode::new(&registry, config).await;
        let closer = PeerIdentity::bare(NodeId::random());
        let key = neighbour_of(closer.node_id);

        let entry = StoredRecordEntry::new(key, b"v".to_vec(), holder.node.local_id(), Duration::from_secs(60));
        assert!(holder.node.handle_store_data(holder.identity(), entry).await);
        let stats = holder.node.stats().await;
        assert_eq!(stats.stored_keys, 1);
        assert_eq!(stats.stale_keys, 0);

        holder.node.handle_ping(closer).await;
        assert_eq!(holder.node.stats().await.stale_keys, 1);
        assert!(holder.node.handle_find_data(holder.identity(), key).await[0].stale);
    }

    #[tokio::test]
    async fn stop_hands_stored_entries_to_remaining_nodes() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 5).await;
        let leaving = &nodes[4];
        let key = NodeId::derive(b"only copy");

        let entry = StoredRecordEntry::new(key, b"kept".to_vec(), leaving.node.local_id(), Duration::from_secs(60));
        assert!(leaving.node.handle_store_data(leaving.identity(), entry).await);

        leaving.node.stop().await;

        let entries = nodes[0].node.fetch_value(key).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"kept");
        assert_eq!(entries[0].creator, leaving.node.local_id());
    }

    #[tokio::test]
    async fn routed_message_reaches_target_once() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = overlay(&registry, 8).await;
        let target = nodes[3].node.local_id();

        nodes[7].node.route_message(target, b"hello".to_vec()).await.unwrap();

        let message = nodes[3].delivered.recv().await.unwrap();
        assert_eq!(message.payload, b"hello");
        assert_eq!(message.source.node_id, nodes[7].node.local_id());
        assert!(nodes[3].delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn routing_reaches_peers_the_origin_does_not_know() {
        let registry = Arc::new(NetworkRegistry::default());
        let origin = TestNode::new(&registry, test_config()).await;
        let relay = TestNode::new(&registry, test_config()).await;
        let mut target = TestNode::new(&registry, test_config()).await;
        for node in [&origin, &relay, &target] {
            node.node.join(Vec::new()).await.unwrap();
        }
        // origin -> relay -> target
        origin.node.handle_ping(relay.identity()).await;
        relay.node.handle_ping(target.identity()).await;

        origin.node.route_message(target.node.local_id(), b"far".to_vec()).await.unwrap();
        let message = target.delivered.recv().await.unwrap();
        assert_eq!(message.payload, b"far");
        assert_eq!(message.routing_path.len(), 1);
        assert_eq!(message.routing_path[0].node_id, relay.node.local_id());
    }

    #[tokio::test]
    async fn forwarding_only_moves_closer_than_previous_hop() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 3).await;
        let target = NodeId::random();
        // the sender sits on the target, so nothing can be closer
        let sender = PeerIdentity::bare(target);
        let message = RoutedMessage::new(sender.clone(), target, b"x".to_vec());

        registry.route_calls.store(0, Ordering::SeqCst);
        let ack = nodes[1].node.handle_route_message(sender, message).await;
        assert_eq!(ack.error, Some(RouteFailure::NoCandidates));
        assert_eq!(registry.route_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn routing_to_absent_id_stays_bounded() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 24).await;
        registry.route_calls.store(0, Ordering::SeqCst);

        let err = nodes[5]
            .node
            .route_message(NodeId::random(), b"nowhere".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, DhtError::Route(RouteFailure::NoCandidates));

        // every node handles the message at most once and gives up after
        // MAX_FAILED_HOPS refusals
        let calls = registry.route_calls.load(Ordering::SeqCst);
        assert!(calls > 0);
        assert!(calls <= MAX_FAILED_HOPS * nodes.len(), "{} route calls", calls);
    }

    #[tokio::test]
    async fn repeated_delivery_is_suppressed() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = overlay(&registry, 2).await;
        let message = RoutedMessage::new(nodes[0].identity(), nodes[1].node.local_id(), b"once".to_vec());

        let first = nodes[1].node.handle_route_message(nodes[0].identity(), message.clone()).await;
        let second = nodes[1].node.handle_route_message(nodes[0].identity(), message).await;
        assert!(first.is_ok());
        assert_eq!(second.error, Some(RouteFailure::Duplicate));
        assert!(nodes[1].delivered.recv().await.is_some());
        assert!(nodes[1].delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_forward_is_suppressed() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 3).await;
        // target is unknown to everyone, so the middle node can only forward
        let message = RoutedMessage::new(nodes[0].identity(), NodeId::random(), b"x".to_vec());

        let _ = nodes[1].node.handle_route_message(nodes[0].identity(), message.clone()).await;
        let again = nodes[1].node.handle_route_message(nodes[0].identity(), message).await;
        assert_eq!(again.error, Some(RouteFailure::Duplicate));
    }

    #[tokio::test]
    async fn routing_requires_joined_state() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(&registry, test_config()).await;
        let err = node.node.route_message(NodeId::random(), Vec::new()).await.unwrap_err();
        assert_eq!(err, DhtError::NotJoined);
    }

    #[tokio::test]
    async fn stop_notifies_neighbours() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 3).await;
        let leaving = nodes[2].node.local_id();
        assert!(nodes[0].node.routing_contacts().await.iter().any(|p| p.node_id == leaving));

        nodes[2].node.stop().await;

        assert!(!nodes[2].network.leave_notices.lock().await.is_empty());
        assert!(!nodes[0].node.routing_contacts().await.iter().any(|p| p.node_id == leaving));
        assert_eq!(nodes[2].node.state().await, NodeState::Stopped);
    }

    #[tokio::test]
    async fn unreachable_peers_are_dropped_during_lookup() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 4).await;
        let dead = nodes[3].node.local_id();
        nodes[0].network.set_failure(dead, true).await;

        let _ = nodes[0].node.find_closest_nodes_from_dht(dead).await.unwrap();
        assert!(!nodes[0].node.routing_contacts().await.iter().any(|p| p.node_id == dead));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peers_do_not_stall_lookups() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = overlay(&registry, 4).await;
        let slow = nodes[2].node.local_id();
        nodes[0].network.set_latency(slow, Duration::from_secs(30)).await;

        let started = Instant::now();
        let found = nodes[0].node.find_closest_nodes_from_dht(slow).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!found.is_empty());
    }

    #[test]
    fn merge_prefers_newest_then_deletion() {
        let key = NodeId::random();
        let creator = NodeId::random();
        let mut older = StoredRecordEntry::new(key, b"old".to_vec(), creator, Duration::from_secs(60));
        older.created_at = 10;
        let mut newer = older.clone();
        newer.created_at = 20;
        newer.value = b"new".to_vec();
        let mut tombstone = newer.clone();
        tombstone.deleted = true;

        let mut merged = HashMap::new();
        merge_entries(&mut merged, vec![newer.clone(), older]);
        assert_eq!(merged[&creator].value, b"new");

        merge_entries(&mut merged, vec![tombstone]);
        assert!(merged[&creator].deleted);

        merge_entries(&mut merged, vec![newer]);
        assert!(merged[&creator].deleted);
    }
}
