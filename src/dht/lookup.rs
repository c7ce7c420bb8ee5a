//! Iterative closest-node search: a distance-ordered candidate set fed by
//! a bounded pool of probe tasks, each of which may report closer nodes.

use crate::data::NodeId;
use crate::dht::message::{Contact, NodeContact};
use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub const MAX_PARALLEL_PROBES: usize = 16;
const CLOSER_NODE_QUEUE: usize = 64;
const LOOKUP_WATCHDOG: Duration = Duration::from_secs(5 * 60);

/// Fixed-capacity map of the contacts closest to a target, keyed by XOR
/// distance.
#[derive(Debug)]
pub struct ProximityMap<V> {
    target: NodeId,
    capacity: usize,
    entries: BTreeMap<NodeId, (NodeId, V)>,
}

impl<V> ProximityMap<V> {
    pub fn new(target: NodeId, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Whether `id` would make it into the map right now.
    pub fn would_insert(&self, id: &NodeId) -> bool {
        let distance = id - &self.target;
        if self.entries.contains_key(&distance) {
            return false;
        }
        if !self.full() {
            return true;
        }
        match self.entries.keys().next_back() {
            Some(farthest) => distance < *farthest,
            None => true,
        }
    }

    pub fn insert(&mut self, id: NodeId, value: V) {
        let distance = &id - &self.target;
        self.entries.insert(distance, (id, value));
        while self.entries.len() > self.capacity {
            self.entries.pop_last();
        }
    }

    /// Entries in non-decreasing distance order.
    pub fn iter(&self) -> impl Iterator<Item = &(NodeId, V)> {
        self.entries.values()
    }

    pub fn into_entries(self) -> Vec<(NodeId, V)> {
        self.entries.into_values().collect()
    }
}

/// Candidate ordering: known ids by XOR distance, then id-less bootstrap
/// contacts; endpoint byte order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    distance: Option<NodeId>,
    contact: Contact,
}

impl Candidate {
    fn new(contact: Contact, target: &NodeId) -> Self {
        Self {
            distance: contact.id.as_ref().map(|id| id - target),
            contact,
        }
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.distance, &other.distance) {
            (Some(l), Some(r)) => l
                .cmp(r)
                .then_with(|| self.contact.addr.cmp(&other.contact.addr)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.contact.addr.cmp(&other.contact.addr),
        }
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Run an iterative lookup towards `target`.
///
/// `evaluate` is called once per probed candidate; it performs its own
/// query, pushes newly learned closer contacts onto the queue it is given,
/// and returns the candidate's contribution to the responsible set (or
/// `None` when the candidate did not answer usefully).
///
/// The search ends when the closest unprobed candidate can no longer enter
/// the responsible set, when candidates run out, when `stop` fires (early
/// success, still `Ok`), or when `cancel` fires (`Err(Aborted)`).
pub async fn collect<O, Fut, E>(
    target: NodeId,
    seeds: Vec<Contact>,
    mut evaluate: E,
    capacity: usize,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> Result<ProximityMap<O>>
where
    O: Send + 'static,
    Fut: Future<Output = Option<O>> + Send + 'static,
    E: FnMut(Contact, mpsc::Sender<NodeContact>) -> Fut,
{
    let mut out = ProximityMap::new(target, capacity);
    let mut candidates: BTreeSet<Candidate> = BTreeSet::new();
    let mut seen: HashSet<SocketAddr> = HashSet::new();

    for seed in seeds {
        if seen.insert(seed.addr) {
            candidates.insert(Candidate::new(seed, &target));
        }
    }

    let (closer_tx, mut closer_rx) = mpsc::channel::<NodeContact>(CLOSER_NODE_QUEUE);
    let mut probes: JoinSet<(Contact, Option<O>)> = JoinSet::new();

    let watchdog = tokio::time::sleep(LOOKUP_WATCHDOG);
    tokio::pin!(watchdog);

    loop {
        // Fold in contacts reported since the last turn.
        while let Ok(contact) = closer_rx.try_recv() {
            if seen.insert(contact.addr) {
                candidates.insert(Candidate::new(contact.into(), &target));
            }
        }

        while probes.len() < MAX_PARALLEL_PROBES {
            let Some(next) = pick_next(&mut candidates, &out) else {
                break;
            };
            trace!(addr = %next.addr, "probing");
            let fut = evaluate(next, closer_tx.clone());
            probes.spawn(async move { (next, fut.await) });
        }

        if probes.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                probes.shutdown().await;
                return Err(Error::Aborted);
            }
            _ = stop.cancelled() => {
                probes.shutdown().await;
                break;
            }
            _ = &mut watchdog => {
                probes.shutdown().await;
                break;
            }
            Some(contact) = closer_rx.recv() => {
                if seen.insert(contact.addr) {
                    candidates.insert(Candidate::new(contact.into(), &target));
                }
            }
            Some(joined) = probes.join_next() => {
                if let Ok((contact, Some(outcome))) = joined {
                    if let Some(id) = contact.id {
                        out.insert(id, outcome);
                    }
                }
            }
        }
    }

    probes.shutdown().await;
    Ok(out)
}

/// The closest unprobed candidate that could still contribute; `None`
/// terminates the search since later candidates are only farther away.
fn pick_next<O>(
    candidates: &mut BTreeSet<Candidate>,
    out: &ProximityMap<O>,
) -> Option<Contact> {
    loop {
        let candidate = *candidates.iter().next()?;
        candidates.remove(&candidate);

        match candidate.contact.id {
            Some(id) => {
                if out.would_insert(&id) {
                    return Some(candidate.contact);
                }
                // Everything after this one is farther; only bootstrap
                // entries may remain useful, and only on an empty map.
                if out.full() {
                    candidates.clear();
                    return None;
                }
            }
            None => {
                if !out.full() {
                    return Some(candidate.contact);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn id_of(n: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        NodeId::new(bytes)
    }

    fn addr_of(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:7000").parse().unwrap()
    }

    #[test]
    fn proximity_map_keeps_the_closest() {
        let target = id_of(0);
        let mut map = ProximityMap::new(target, 2);

        map.insert(id_of(200), "far");
        map.insert(id_of(3), "near");
        assert!(map.full());

        assert!(map.would_insert(&id_of(2)));
        assert!(!map.would_insert(&id_of(201)));

        map.insert(id_of(2), "nearer");

        let ids: Vec<u8> = map.iter().map(|(id, _)| id.as_bytes()[19]).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn lookup_walks_towards_the_target() {
        let target = id_of(0);

        // A little synthetic network: each node knows the node with half
        // its last byte.
        let mut world: HashMap<SocketAddr, NodeContact> = HashMap::new();
        let mut n = 128u8;
        while n > 1 {
            world.insert(
                addr_of(n),
                NodeContact {
                    id: id_of(n / 2),
                    addr: addr_of(n / 2),
                },
            );
            n /= 2;
        }

        let world = Arc::new(world);
        let seeds = vec![Contact {
            id: Some(id_of(128)),
            addr: addr_of(128),
        }];

        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();

        let out = collect(
            target,
            seeds,
            |contact, closer_tx| {
                let world = world.clone();
                async move {
                    if let Some(next) = world.get(&contact.addr) {
                        let _ = closer_tx.send(*next).await;
                    }
                    contact.id
                }
            },
            4,
            &cancel,
            &stop,
        )
        .await
        .unwrap();

        let ids: Vec<u8> = out.iter().map(|(id, _)| id.as_bytes()[19]).collect();
        assert_eq!(ids, vec![1, 2, 4, 8]);
    }

    #[tokio::test]
    async fn cancelled_lookup_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stop = CancellationToken::new();

        let seeds = vec![Contact {
            id: Some(id_of(1)),
            addr: addr_of(1),
        }];

        let res = collect(
            id_of(0),
            seeds,
            |contact, _closer| async move { contact.id },
            4,
            &cancel,
            &stop,
        )
        .await;

        assert!(matches!(res, Err(Error::Aborted)));
    }
}
