use crate::download::occupancy::{OccupancyPool, PoolRole};
use crate::download::peer::{
    ChunkRequest, CoreEvent, EventSender, PeerError, PeerHandle, PeerResult, ProgressReporter,
    Reply,
};
use crate::download::types::{EntityId, TransferId};
use crate::hash::Hash;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Finished { chunk_index: usize, bytes: u64 },
    Failed { chunk_index: usize, error: PeerError },
}

/// Transfer of one chunk from one peer.
#[derive(Debug)]
pub struct ChunkTransfer {
    id: TransferId,
    entity: EntityId,
    peer: Hash,
    request: ChunkRequest,
    state: TransferState,
    started_at: Option<Instant>,
    transferred: u64,
}

impl ChunkTransfer {
    pub(crate) fn new(id: TransferId, entity: EntityId, peer: Hash, request: ChunkRequest) -> Self {
        Self {
            id,
            entity,
            peer,
            request,
            state: TransferState::Created,
            started_at: None,
            transferred: 0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn peer(&self) -> Hash {
        self.peer
    }

    pub fn chunk_index(&self) -> usize {
        self.request.chunk_index
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Takes the chunk-transfer slot of the peer and issues the request.
    ///
    /// Returns false without side effects when the peer is already busy transferring.
    pub fn start_downloading(
        &mut self,
        pool: &mut OccupancyPool,
        handle: &dyn PeerHandle,
        events: &EventSender,
    ) -> bool {
        debug_assert_eq!(pool.role(), PoolRole::ChunkTransfer);
        if self.state != TransferState::Created {
            return false;
        }
        if !pool.try_acquire(self.peer) {
            tracing::trace!(
                peer = %self.peer,
                chunk = self.request.chunk_index,
                "peer already transferring a chunk"
            );
            return false;
        }

        self.state = TransferState::Running;
        self.started_at = Some(Instant::now());

        let (entity, transfer) = (self.entity, self.id);
        let progress = ProgressReporter::new(events.clone(), entity, transfer);
        let reply = Reply::new(events.clone(), move |result| CoreEvent::ChunkFinished {
            entity,
            transfer,
            result,
        });
        tracing::debug!(
            peer = %self.peer,
            entity = %entity,
            transfer = %transfer,
            chunk = self.request.chunk_index,
            name = %self.request.file.name,
            "chunk transfer started"
        );
        handle.get_chunk(self.request.clone(), progress, reply);
        true
    }

    pub fn on_progress(&mut self, bytes: u64) {
        if self.state == TransferState::Running {
            self.transferred = bytes.min(self.request.len);
        }
    }

    /// Terminal step: frees the peer's slot and reports what happened to the chunk.
    pub fn finish(mut self, pool: &mut OccupancyPool, result: PeerResult<u64>) -> TransferOutcome {
        if self.state == TransferState::Running {
            pool.release(self.peer);
        }
        let chunk_index = self.request.chunk_index;
        match result {
            Ok(bytes) => {
                self.state = TransferState::Finished;
                self.transferred = bytes;
                TransferOutcome::Finished { chunk_index, bytes }
            }
            Err(error) => {
                self.state = TransferState::Failed;
                tracing::debug!(
                    peer = %self.peer,
                    transfer = %self.id,
                    chunk = chunk_index,
                    error = %error,
                    "chunk transfer failed"
                );
                TransferOutcome::Failed { chunk_index, error }
            }
        }
    }

    /// Bytes per second since the transfer started.
    pub fn download_rate(&self, now: Instant) -> u64 {
        let Some(started) = self.started_at else {
            return 0;
        };
        let elapsed_ms = now.saturating_duration_since(started).as_millis().max(1) as u64;
        self.transferred.saturating_mul(1000) / elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::Entry;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingPeer {
        calls: Mutex<Vec<(ChunkRequest, Reply<u64>)>>,
    }

    impl PeerHandle for RecordingPeer {
        fn id(&self) -> Hash {
            Hash::new([1u8; 20])
        }
        fn get_entries(&self, _dir: &Entry, _reply: Reply<Vec<Entry>>) {}
        fn get_hashes(&self, _file: &Entry, _reply: Reply<Vec<Hash>>) {}
        fn get_chunk(&self, request: ChunkRequest, _progress: ProgressReporter, reply: Reply<u64>) {
            self.calls.lock().expect("lock").push((request, reply));
        }
    }

    fn request(index: usize) -> ChunkRequest {
        ChunkRequest {
            file: Entry::file("/", "f.bin", 100),
            chunk_index: index,
            hash: Hash::new([5u8; 20]),
            offset: 0,
            len: 100,
        }
    }

    #[test]
    fn start_requires_free_slot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RecordingPeer::default();
        let mut pool = OccupancyPool::new(PoolRole::ChunkTransfer);
        let p = peer.id();

        let mut first = ChunkTransfer::new(TransferId(1), EntityId(1), p, request(0));
        let mut second = ChunkTransfer::new(TransferId(2), EntityId(1), p, request(1));
        assert!(first.start_downloading(&mut pool, &peer, &tx));
        assert!(!second.start_downloading(&mut pool, &peer, &tx));
        assert_eq!(second.state(), TransferState::Created);
        assert_eq!(peer.calls.lock().expect("lock").len(), 1);
        assert!(pool.is_occupied(&p));
    }

    #[test]
    fn finish_releases_slot_and_reports_outcome() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RecordingPeer::default();
        let mut pool = OccupancyPool::new(PoolRole::ChunkTransfer);
        let mut freed = pool.subscribe();

        let mut t = ChunkTransfer::new(TransferId(1), EntityId(1), peer.id(), request(2));
        assert!(t.start_downloading(&mut pool, &peer, &tx));
        let outcome = t.finish(&mut pool, Ok(100));
        assert_eq!(
            outcome,
            TransferOutcome::Finished {
                chunk_index: 2,
                bytes: 100
            }
        );
        assert!(!pool.is_occupied(&peer.id()));
        assert_eq!(freed.try_recv().expect("freed"), peer.id());
    }

    #[test]
    fn failed_transfer_also_releases() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RecordingPeer::default();
        let mut pool = OccupancyPool::new(PoolRole::ChunkTransfer);

        let mut t = ChunkTransfer::new(TransferId(1), EntityId(1), peer.id(), request(0));
        assert!(t.start_downloading(&mut pool, &peer, &tx));
        let outcome = t.finish(&mut pool, Err(PeerError::Unavailable));
        assert!(matches!(outcome, TransferOutcome::Failed { chunk_index: 0, .. }));
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_uses_elapsed_time() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RecordingPeer::default();
        let mut pool = OccupancyPool::new(PoolRole::ChunkTransfer);
        let mut t = ChunkTransfer::new(TransferId(1), EntityId(1), peer.id(), request(0));
        assert_eq!(t.download_rate(Instant::now()), 0);

        assert!(t.start_downloading(&mut pool, &peer, &tx));
        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        t.on_progress(80);
        assert_eq!(t.download_rate(Instant::now()), 40);

        t.on_progress(500);
        assert_eq!(t.transferred(), 100);
    }
}
