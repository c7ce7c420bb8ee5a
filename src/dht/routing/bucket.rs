use crate::constants::K_NODE_PER_BUCKET;
use crate::data::NodeId;
use crate::dht::message::NodeContact;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

const NODE_VALIDITY_SECS: u64 = 15 * 60;

/// Consecutive failed queries after which a node becomes replaceable.
pub const MAX_SEQUENTIAL_FAILURES: u8 = 3;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Bucket {
    depth: usize,
    data: [Option<Node>; K_NODE_PER_BUCKET],
}

#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    #[serde(skip)]
    last_seen: Option<Instant>,
    #[serde(skip)]
    failed_queries: u8,
}

impl Node {
    fn new(id: NodeId, addr: SocketAddr, confirmed: bool) -> Self {
        Self {
            id,
            addr,
            last_seen: confirmed.then(Instant::now),
            failed_queries: 0,
        }
    }

    pub fn contact(&self) -> NodeContact {
        NodeContact {
            id: self.id,
            addr: self.addr,
        }
    }

    pub fn confirm(&mut self) {
        self.last_seen = Some(Instant::now());
        self.failed_queries = 0;
    }

    pub fn fail(&mut self) {
        self.failed_queries = self.failed_queries.saturating_add(1);
    }

    /// The eviction policy hook: replied recently, and not on a failure
    /// streak.
    pub fn is_good(&self) -> bool {
        match &self.last_seen {
            None => false,
            Some(seen) => {
                seen.elapsed() < Duration::from_secs(NODE_VALIDITY_SECS)
                    && self.failed_queries < MAX_SEQUENTIAL_FAILURES
            }
        }
    }

    fn good_in(node: &Option<Node>) -> Option<&Node> {
        node.as_ref().filter(|n| n.is_good())
    }
}

impl Bucket {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            data: [(); K_NODE_PER_BUCKET].map(|_| Option::<Node>::default()),
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.data
            .iter()
            .flatten()
            .find(|node| node.id == *id)
    }

    pub fn get_node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.data
            .iter_mut()
            .flatten()
            .find(|node| node.id == *id)
    }

    /// Insert or refresh a contact. Fails only when the bucket is full of
    /// good nodes.
    pub fn try_insert(&mut self, id: &NodeId, addr: &SocketAddr, confirmed: bool) -> bool {
        if let Some(node) = self.get_node_mut(id) {
            node.addr = *addr;
            if confirmed {
                node.confirm();
            }
            return true;
        }

        let Some(slot) = self.find_replaceable_slot() else {
            return false;
        };

        *slot = Some(Node::new(*id, *addr, confirmed));
        true
    }

    pub fn split(self) -> (Self, Self) {
        let mut zero = Bucket::new(self.depth + 1);
        let mut one = Bucket::new(self.depth + 1);

        let mut zero_idx = 0;
        let mut one_idx = 0;

        for node in self.data.into_iter().flatten() {
            if node.id.get_bit(self.depth) {
                one.data[one_idx] = Some(node);
                one_idx += 1;
            } else {
                zero.data[zero_idx] = Some(node);
                zero_idx += 1;
            }
        }

        (zero, one)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get_node(id).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.find_replaceable_slot_idx().is_none()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.data.iter().flatten()
    }

    pub fn iter_over_goods(&self) -> impl Iterator<Item = &Node> {
        self.data.iter().filter_map(Node::good_in)
    }

    pub fn id_within_bucket_range(&self, own_id: &NodeId, id: &NodeId) -> bool {
        match own_id.first_diff_bit_idx(id) {
            None => true,
            Some(first_diff) => first_diff > self.depth,
        }
    }

    fn find_replaceable_slot(&mut self) -> Option<&mut Option<Node>> {
        let idx = self.find_replaceable_slot_idx()?;
        Some(&mut self.data[idx])
    }

    fn find_replaceable_slot_idx(&self) -> Option<usize> {
        if let Some(vacant) = self.data.iter().position(|slot| slot.is_none()) {
            return Some(vacant);
        }

        self.data
            .iter()
            .position(|slot| Node::good_in(slot).is_none())
    }

    #[cfg(test)]
    pub fn count_empty(&self) -> usize {
        self.data.iter().filter(|slot| slot.is_none()).count()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ds = f.debug_struct("Node");
        ds.field("id", &self.id)
            .field("addr", &self.addr)
            .field("failed", &self.failed_queries);
        match &self.last_seen {
            Some(instant) => ds.field("last_seen", &instant.elapsed()).finish(),
            None => ds.finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ID_LEN;

    fn random_node() -> (NodeId, SocketAddr) {
        let id = NodeId::random();
        let octets: [u8; 4] = rand::random();
        let addr = SocketAddr::from((octets, u16::max(1, rand::random())));
        (id, addr)
    }

    #[test]
    fn insert_and_refresh() {
        let mut bucket = Bucket::new(0);

        let nodes: Vec<(NodeId, SocketAddr)> =
            (0..K_NODE_PER_BUCKET).map(|_| random_node()).collect();

        for (id, addr) in &nodes {
            assert!(bucket.try_insert(id, addr, true));
        }

        // Full of good nodes.
        let (id, addr) = random_node();
        assert!(!bucket.try_insert(&id, &addr, true));

        // A failing node becomes replaceable.
        let victim = nodes[2].0;
        for _ in 0..MAX_SEQUENTIAL_FAILURES {
            bucket.get_node_mut(&victim).unwrap().fail();
        }
        assert!(bucket.try_insert(&id, &addr, true));
        assert!(!bucket.contains(&victim));
        assert!(bucket.contains(&id));
    }

    #[test]
    fn unconfirmed_nodes_are_not_good() {
        let mut bucket = Bucket::new(0);
        let (id, addr) = random_node();

        assert!(bucket.try_insert(&id, &addr, false));
        assert_eq!(bucket.iter_over_goods().count(), 0);

        bucket.get_node_mut(&id).unwrap().confirm();
        assert_eq!(bucket.iter_over_goods().count(), 1);
    }

    #[test]
    fn split_by_bit() {
        let depth = 3;
        let mut bucket = Bucket::new(depth);

        let first_bytes = [
            0b0110_0000,
            0b0110_0100,
            0b0110_1000,
            0b0110_1100,
            0b0111_0000,
            0b0111_0100,
            0b0111_1100,
        ];

        for first in first_bytes {
            let mut id_bytes = [0u8; ID_LEN];
            id_bytes[0] = first;
            let (_, addr) = random_node();
            assert!(bucket.try_insert(&NodeId::new(id_bytes), &addr, true));
        }

        let (zero, one) = bucket.split();

        assert_eq!(zero.iter_over_goods().count(), 4);
        assert_eq!(zero.count_empty(), 4);
        assert_eq!(one.iter_over_goods().count(), 3);
        assert_eq!(one.count_empty(), 5);
        assert_eq!(zero.depth(), depth + 1);
        assert_eq!(one.depth(), depth + 1);
    }
}
