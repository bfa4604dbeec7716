//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use crate::common::Id;

/// A node is good if we queried it, or it replied to us, within this window.
pub const NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq)]
/// Node entry in Kademlia routing table
pub struct Node {
    /// `None` for addresses restored from a snapshot that haven't told us their id yet.
    pub id: Option<Id>,
    pub address: SocketAddrV4,
    pub last_query: Option<Instant>,
    pub last_reply: Option<Instant>,
    pub has_ever_replied: bool,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id: Some(id),
            address,
            last_query: None,
            last_reply: None,
            has_ever_replied: false,
        }
    }

    /// Creates a Node for an address whose id is unknown.
    pub fn candidate(address: SocketAddrV4) -> Node {
        Node {
            id: None,
            address,
            last_query: None,
            last_reply: None,
            has_ever_replied: false,
        }
    }

    #[cfg(test)]
    pub fn random() -> Node {
        Node::new(
            Id::random(),
            SocketAddrV4::new(rand::random::<u32>().into(), rand::random()),
        )
    }

    // === Getters ===

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    // === Public Methods ===

    /// Record a contact at `now`, either a query or a reply.
    pub fn touch(&mut self, query: bool, now: Instant) {
        if query {
            self.last_query = Some(now);
        } else {
            self.last_reply = Some(now);
            self.has_ever_replied = true;
        }
    }

    /// Returns `true` if this node was queried or replied within [NODE_GOOD_WINDOW].
    pub fn is_good(&self) -> bool {
        self.is_good_at(Instant::now())
    }

    /// Same as [Self::is_good] evaluated at `now`.
    pub fn is_good_at(&self, now: Instant) -> bool {
        let recent = |at: Option<Instant>| {
            at.map(|at| now.saturating_duration_since(at) < NODE_GOOD_WINDOW)
                .unwrap_or(false)
        };

        recent(self.last_query) || (self.has_ever_replied && recent(self.last_reply))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_node_is_not_good() {
        assert!(!Node::random().is_good());
    }

    #[test]
    fn queried_recently_is_good() {
        let now = Instant::now();
        let mut node = Node::random();
        node.touch(true, now);

        assert!(node.is_good_at(now + Duration::from_secs(60)));
        assert!(!node.is_good_at(now + NODE_GOOD_WINDOW));
    }

    #[test]
    fn stale_node_without_reply_is_not_good() {
        let now = Instant::now();
        let mut node = Node::random();
        node.touch(true, now);

        assert!(!node.is_good_at(now + Duration::from_secs(16 * 60)));
    }

    #[test]
    fn recent_reply_is_good_even_after_old_query() {
        let start = Instant::now();
        let mut node = Node::random();

        node.touch(true, start);
        node.touch(false, start + Duration::from_secs(19 * 60));

        // Queried 20 minutes ago, replied 1 minute ago.
        assert!(node.is_good_at(start + Duration::from_secs(20 * 60)));
        assert!(node.has_ever_replied);
    }
}
