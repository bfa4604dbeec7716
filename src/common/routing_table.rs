//! Fixed size Kademlia routing table.

use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::trace;

use crate::common::{Id, Node};

/// K = the maximum size of a bucket.
pub const MAX_BUCKET_SIZE_K: usize = 8;
/// Number of buckets in the default table sizing.
pub const DEFAULT_BUCKET_COUNT: usize = 32;

#[derive(Debug, Clone)]
/// Kademlia routing table with a fixed number of buckets.
///
/// Bucket `i` holds nodes sharing exactly `i` leading bits with our id,
/// except the last bucket which holds everything closer than that.
pub struct RoutingTable {
    id: Id,
    buckets: Vec<KBucket>,
    /// Addresses without a known id, waiting for a live contact to place them.
    candidates: Vec<Node>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and [DEFAULT_BUCKET_COUNT] buckets.
    pub fn new(id: Id) -> Self {
        Self::with_bucket_count(id, DEFAULT_BUCKET_COUNT)
    }

    /// Create a new [RoutingTable] with `bucket_count` buckets (at least one).
    pub fn with_bucket_count(id: Id, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.clamp(1, crate::common::ID_BITS + 1);

        RoutingTable {
            id,
            buckets: vec![KBucket::new(); bucket_count],
            candidates: Vec::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    // === Public Methods ===

    /// Index of the bucket `id` belongs to, clamped to the last bucket.
    pub fn bucket_index(&self, id: &Id) -> usize {
        self.id.shared_prefix_len(id).min(self.buckets.len() - 1)
    }

    /// Record a contact with `id` at `address`, see [Self::update_at].
    pub fn update(&mut self, id: Id, address: SocketAddrV4, query: bool) -> bool {
        self.update_at(id, address, query, Instant::now())
    }

    /// Record a contact with `id` at `address` happening at `now`.
    ///
    /// `query` is true when the contact was a query, and false for a reply.
    ///
    /// A node at the same address in the target bucket is updated in place,
    /// otherwise the new node takes the first empty or no longer good slot.
    /// If every slot holds a good node the contact is dropped.
    ///
    /// Returns `true` if the table was changed.
    pub fn update_at(&mut self, id: Id, address: SocketAddrV4, query: bool, now: Instant) -> bool {
        if id == self.id {
            return false;
        }

        self.candidates.retain(|candidate| candidate.address != address);

        let index = self.bucket_index(&id);
        let bucket = &mut self.buckets[index];

        if let Some(existing) = bucket.get_mut(&address) {
            existing.touch(query, now);
            return true;
        }

        let mut node = Node::new(id, address);
        node.touch(query, now);

        let added = bucket.add_at(node, now);

        if !added {
            trace!(
                context = "routing_table",
                ?id,
                ?address,
                bucket = index,
                "Bucket full of good nodes, dropping contact"
            );
        }

        added
    }

    /// Add an address without a known id, returns `false` if it is already known
    /// or there is no room left for candidates.
    pub fn add_candidate(&mut self, address: SocketAddrV4) -> bool {
        if self.contains_address(&address) {
            return false;
        }

        if self.candidates.len() >= self.buckets.len() * MAX_BUCKET_SIZE_K {
            return false;
        }

        self.candidates.push(Node::candidate(address));
        true
    }

    /// Nodes restored without an id.
    pub fn candidates(&self) -> &[Node] {
        &self.candidates
    }

    /// Returns `true` if a node with this address is in a bucket or a candidate.
    pub fn contains_address(&self, address: &SocketAddrV4) -> bool {
        self.nodes().any(|node| &node.address == address)
            || self.candidates.iter().any(|node| &node.address == address)
    }

    /// Return up to [MAX_BUCKET_SIZE_K] nodes closest to the target.
    pub fn closest(&self, target: &Id) -> Vec<Node> {
        let mut nodes: Vec<(Id, &Node)> = self
            .nodes()
            .filter_map(|node| node.id.map(|id| (id.distance(target), node)))
            .collect();

        nodes.sort_by(|a, b| a.0.cmp(&b.0));

        nodes
            .into_iter()
            .take(MAX_BUCKET_SIZE_K)
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Returns `true` if no bucket holds a node.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes placed in buckets.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Returns an iterator over the nodes in buckets, in bucket then slot order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Addresses of every bucket node followed by every candidate.
    pub fn addresses(&self) -> Vec<SocketAddrV4> {
        self.nodes()
            .chain(self.candidates.iter())
            .map(|node| node.address)
            .collect()
    }
}

/// A bucket of [MAX_BUCKET_SIZE_K] slots.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    slots: [Option<Node>; MAX_BUCKET_SIZE_K],
}

impl KBucket {
    pub fn new() -> Self {
        Self::default()
    }

    // === Public Methods ===

    /// Put `incoming` in the first empty slot, or the first slot whose node is no
    /// longer good at `now`.
    pub fn add_at(&mut self, incoming: Node, now: Instant) -> bool {
        let slot = self.slots.iter_mut().find(|slot| match slot {
            None => true,
            Some(node) => !node.is_good_at(now),
        });

        match slot {
            Some(slot) => {
                *slot = Some(incoming);
                true
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self, address: &SocketAddrV4) -> Option<&mut Node> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|node| &node.address == address)
    }

    /// Slot contents in index order.
    pub fn slots(&self) -> &[Option<Node>] {
        &self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
