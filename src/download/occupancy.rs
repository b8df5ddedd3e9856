use crate::hash::Hash;
use std::collections::HashSet;
use tokio::sync::broadcast;

const FREED_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolRole {
    HashRetrieval,
    ChunkTransfer,
}

impl PoolRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HashRetrieval => "hash_retrieval",
            Self::ChunkTransfer => "chunk_transfer",
        }
    }
}

/// Peers currently engaged in one role. A peer is engaged at most once per pool.
///
/// Releasing a peer broadcasts it to every subscriber. Pools never share state; the hash and
/// chunk roles each get their own instance.
#[derive(Debug)]
pub struct OccupancyPool {
    role: PoolRole,
    occupied: HashSet<Hash>,
    freed_tx: broadcast::Sender<Hash>,
}

impl OccupancyPool {
    pub fn new(role: PoolRole) -> Self {
        let (freed_tx, _) = broadcast::channel(FREED_CHANNEL_CAPACITY);
        Self {
            role,
            occupied: HashSet::new(),
            freed_tx,
        }
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Hash> {
        self.freed_tx.subscribe()
    }

    /// False if the peer is already engaged in this role.
    pub fn try_acquire(&mut self, peer: Hash) -> bool {
        self.occupied.insert(peer)
    }

    pub fn release(&mut self, peer: Hash) {
        if !self.occupied.remove(&peer) {
            tracing::debug!(
                role = self.role.as_str(),
                peer = %peer,
                "release of a peer that was not engaged"
            );
            return;
        }
        // No subscriber is fine (e.g. during shutdown).
        let _ = self.freed_tx.send(peer);
    }

    pub fn is_occupied(&self, peer: &Hash) -> bool {
        self.occupied.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }
}
