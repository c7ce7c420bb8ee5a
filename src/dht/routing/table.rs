use super::bucket::Bucket;
use crate::constants::{ID_BIT_COUNT, K_NODE_PER_BUCKET};
use crate::data::NodeId;
use crate::dht::message::NodeContact;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::Node;

/// Binary-trie routing table: bucket `i` covers contacts whose first bit
/// differing from our id is bit `i`; the last bucket contains our own id
/// and is the only one that splits.
#[derive(Debug, Deserialize, Serialize)]
pub struct RoutingTable {
    own_id: NodeId,
    data: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        let mut data = Vec::with_capacity(ID_BIT_COUNT + 1);
        data.push(Bucket::new(0));
        Self { own_id, data }
    }

    /// Reload a cached table; rejected when the cached id differs from the
    /// freshly derived one (the WAN address changed).
    pub async fn load(path: &Path, own_id: &NodeId) -> Result<Self> {
        let mut buf = Vec::new();
        File::open(path).await?.read_to_end(&mut buf).await?;

        let table: RoutingTable = bincode::deserialize(&buf)?;
        if table.own_id != *own_id {
            return Err(anyhow!("cached routing table belongs to another id"));
        }
        Ok(table)
    }

    pub async fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = bincode::serialize(self)?;
        let mut file = File::create(path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.data.iter().flat_map(|bucket| bucket.iter_nodes())
    }

    pub fn count_good_nodes(&self) -> usize {
        self.data
            .iter()
            .map(|bucket| bucket.iter_over_goods().count())
            .sum()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get_bucket(id).contains(id)
    }

    /// Insert or refresh a contact. `confirmed` marks contacts we have
    /// verified with a reply; unconfirmed ones only fill free slots.
    pub fn try_add(&mut self, contact: &NodeContact, confirmed: bool) {
        if contact.id == self.own_id {
            return;
        }

        loop {
            if self
                .get_bucket_mut(&contact.id)
                .try_insert(&contact.id, &contact.addr, confirmed)
            {
                return;
            }

            if !self.id_within_splittable_bucket(&contact.id) || self.max_depth_reached() {
                debug!(id = ?contact.id, "dropping contact, bucket full");
                return;
            }

            self.split();
        }
    }

    /// Record a failed query against a contact.
    pub fn fail_node(&mut self, contact: &NodeContact) {
        if let Some(node) = self.get_bucket_mut(&contact.id).get_node_mut(&contact.id) {
            node.fail();
        }
    }

    /// Up to `n` good contacts ordered by non-decreasing XOR distance to
    /// `target`.
    pub fn find_closest(&self, target: &NodeId, n: usize) -> Vec<NodeContact> {
        let mut nodes: Vec<&Node> = Vec::new();

        let target_bucket = self.find_bucket_idx_by_id(target);
        for bucket in self.data[target_bucket..]
            .iter()
            .chain(self.data[..target_bucket].iter().rev())
        {
            nodes.extend(bucket.iter_over_goods());
            if nodes.len() >= n.max(K_NODE_PER_BUCKET) {
                break;
            }
        }

        nodes.sort_by(|a, b| (&a.id - target).cmp(&(&b.id - target)));
        nodes.into_iter().take(n).map(Node::contact).collect()
    }

    /// BEP-5 `find_node` semantics: the exact contact alone when known,
    /// the closest K otherwise.
    pub fn find_node(&self, target: &NodeId) -> Vec<NodeContact> {
        if let Some(exact) = self.get_bucket(target).get_node(target) {
            return vec![exact.contact()];
        }
        self.find_closest(target, K_NODE_PER_BUCKET)
    }

    /// Lookup targets inside buckets that still have room, used to refresh
    /// the table periodically.
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        let mut targets = Vec::new();

        for bucket in &self.data[..self.data.len() - 1] {
            if bucket.is_full() {
                continue;
            }
            let mut id = self.own_id;
            id.flip_bit(bucket.depth());
            id.randomize_after_bit(bucket.depth());
            targets.push(id);
        }

        let last = self.data.last().expect("table always has a bucket");
        if !(last.depth() == ID_BIT_COUNT && last.is_full()) {
            targets.push(self.own_id);
        }

        targets
    }

    fn get_bucket(&self, id: &NodeId) -> &Bucket {
        &self.data[self.find_bucket_idx_by_id(id)]
    }

    fn get_bucket_mut(&mut self, id: &NodeId) -> &mut Bucket {
        let idx = self.find_bucket_idx_by_id(id);
        &mut self.data[idx]
    }

    fn find_bucket_idx_by_id(&self, id: &NodeId) -> usize {
        match self.own_id.first_diff_bit_idx(id) {
            // Own bucket.
            None => self.data.len() - 1,
            // A diff deeper than current coverage also lands in the last
            // bucket.
            Some(first_diff) => first_diff.min(self.data.len() - 1),
        }
    }

    fn max_depth_reached(&self) -> bool {
        self.data.len() == ID_BIT_COUNT + 1
    }

    fn id_within_splittable_bucket(&self, id: &NodeId) -> bool {
        self.data
            .last()
            .expect("table always has a bucket")
            .id_within_bucket_range(&self.own_id, id)
    }

    fn split(&mut self) {
        let splittable = self.data.pop().expect("table always has a bucket");
        let parent_depth = splittable.depth();
        let (zero_at_depth, one_at_depth) = splittable.split();

        let (own_bucket, other_bucket) = if self.own_id.get_bit(parent_depth) {
            (one_at_depth, zero_at_depth)
        } else {
            (zero_at_depth, one_at_depth)
        };

        self.data.push(other_bucket);
        self.data.push(own_bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ID_LEN;
    use std::net::SocketAddr;

    fn contact(id: NodeId) -> NodeContact {
        let octets: [u8; 4] = rand::random();
        NodeContact {
            id,
            addr: SocketAddr::from((octets, u16::max(1, rand::random()))),
        }
    }

    fn id_with_first(first: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = first;
        NodeId::new(bytes)
    }

    #[test]
    fn insert_and_contains() {
        let mut rt = RoutingTable::new(NodeId::random());
        let c = contact(NodeId::random());

        rt.try_add(&c, true);

        assert!(rt.contains(&c.id));
    }

    #[test]
    fn no_duplicates() {
        let mut rt = RoutingTable::new(NodeId::random());
        let c = contact(NodeId::random());

        rt.try_add(&c, true);
        rt.try_add(&c, true);
        rt.try_add(&c, true);

        assert_eq!(rt.iter_nodes().count(), 1);
    }

    #[test]
    fn split_on_own_bucket_overflow() {
        let own_id = id_with_first(0b1111_1111);
        let mut rt = RoutingTable::new(own_id);
        let mut id = own_id;
        id.flip_bit(ID_BIT_COUNT - 1);

        for i in 0..K_NODE_PER_BUCKET {
            rt.try_add(&contact(id), true);
            id.flip_bit(0);
            id.flip_bit(i + 1);
        }
        rt.try_add(&contact(id), true);

        assert_eq!(rt.data.len(), 2);
        assert_eq!(rt.iter_nodes().count(), K_NODE_PER_BUCKET + 1);
    }

    #[test]
    fn find_node_exact() {
        let mut rt = RoutingTable::new(NodeId::random());
        let target = contact(NodeId::random());

        for _ in 0..20 {
            rt.try_add(&contact(NodeId::random()), true);
        }
        rt.try_add(&target, true);

        let found = rt.find_node(&target.id);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, target.id);
    }

    #[test]
    fn find_closest_is_sorted_by_distance() {
        let mut rt = RoutingTable::new(NodeId::random());
        let target = NodeId::random();

        for _ in 0..260 {
            rt.try_add(&contact(NodeId::random()), true);
        }

        let closest = rt.find_closest(&target, K_NODE_PER_BUCKET);
        assert!(!closest.is_empty());

        for pair in closest.windows(2) {
            assert!((&pair[0].id - &target) <= (&pair[1].id - &target));
        }
    }

    #[test]
    fn failures_evict() {
        let mut rt = RoutingTable::new(NodeId::random());
        let c = contact(NodeId::random());
        rt.try_add(&c, true);

        assert_eq!(rt.count_good_nodes(), 1);
        for _ in 0..3 {
            rt.fail_node(&c);
        }
        assert_eq!(rt.count_good_nodes(), 0);

        // A reply rehabilitates.
        rt.try_add(&c, true);
        assert_eq!(rt.count_good_nodes(), 1);
    }

    #[tokio::test]
    async fn cache_round_trip() {
        let own_id = NodeId::random();
        let mut rt = RoutingTable::new(own_id);
        for _ in 0..128 {
            rt.try_add(&contact(NodeId::random()), true);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht");
        rt.store(&path).await.unwrap();

        let loaded = RoutingTable::load(&path, &own_id).await.unwrap();
        assert_eq!(
            rt.iter_nodes().map(|n| n.id).collect::<Vec<_>>(),
            loaded.iter_nodes().map(|n| n.id).collect::<Vec<_>>(),
        );

        // A different own id rejects the cache.
        assert!(RoutingTable::load(&path, &NodeId::random()).await.is_err());
    }

    #[test]
    fn refresh_targets_cover_fillable_buckets() {
        let own_id = id_with_first(0b1111_1111);
        let mut rt = RoutingTable::new(own_id);

        for first in [0b0000_0000, 0b1000_0000] {
            let mut id = id_with_first(first);
            id.randomize_after_bit(8);
            rt.try_add(&contact(id), true);
        }

        // One unsplit, non-full bucket: a single target for it.
        assert_eq!(rt.refresh_targets().len(), 1);
    }
}
