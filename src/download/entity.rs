use crate::download::chunk::{ChunkTransfer, TransferOutcome};
use crate::download::occupancy::OccupancyPool;
use crate::download::peer::{
    ChunkRequest, CoreEvent, EventSender, FileCache, PeerDirectory, PeerError, PeerHandle,
    PeerResult, Reply,
};
use crate::download::types::{
    CHUNK_SIZE, DownloadFault, DownloadStatus, DownloadSummary, EntityId, Entry, EntryKind,
    QueueRecord, TransferId,
};
use crate::hash::Hash;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Everything an entity may touch while looking for work, borrowed from the manager.
pub(crate) struct DispatchCtx<'a> {
    pub peers: &'a dyn PeerDirectory,
    pub hash_pool: &'a mut OccupancyPool,
    pub events: &'a EventSender,
    pub next_transfer: &'a mut u64,
}

/// A chunk ready to be started, with the handle of the peer it will come from.
pub struct DispatchableChunk {
    pub transfer: ChunkTransfer,
    pub handle: Arc<dyn PeerHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlot {
    pub index: usize,
    pub hash: Option<Hash>,
    pub done: bool,
}

#[derive(Debug)]
pub enum Download {
    Dir(DirDownload),
    File(FileDownload),
}

impl Download {
    pub fn id(&self) -> EntityId {
        match self {
            Self::Dir(d) => d.id,
            Self::File(f) => f.id,
        }
    }

    pub fn entry(&self) -> &Entry {
        match self {
            Self::Dir(d) => &d.entry,
            Self::File(f) => &f.entry,
        }
    }

    pub fn peer_source(&self) -> Hash {
        match self {
            Self::Dir(d) => d.peer_source,
            Self::File(f) => f.peer_source,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::Dir(d) => d.status(),
            Self::File(f) => f.status(),
        }
    }

    pub fn populate_entry(&self) -> QueueRecord {
        match self {
            Self::Dir(d) => d.populate_entry(),
            Self::File(f) => f.populate_entry(),
        }
    }

    pub fn as_file(&self) -> Option<&FileDownload> {
        match self {
            Self::File(f) => Some(f),
            Self::Dir(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileDownload> {
        match self {
            Self::File(f) => Some(f),
            Self::Dir(_) => None,
        }
    }

    pub fn summary(&self, now: Instant) -> DownloadSummary {
        let entry = self.entry();
        let (chunk_count, done_chunks, active_transfers, download_rate) = match self {
            Self::Dir(_) => (0, 0, 0, 0),
            Self::File(f) => (
                f.chunk_count(),
                f.done_chunks(),
                f.active_transfers(),
                f.download_rate(now),
            ),
        };
        DownloadSummary {
            id: self.id(),
            kind: entry.kind,
            path: entry.path.clone(),
            name: entry.name.clone(),
            size: entry.size,
            peer_source: self.peer_source(),
            status: self.status(),
            chunk_count,
            done_chunks,
            active_transfers,
            download_rate,
        }
    }
}

/// A directory waiting for its remote listing.
#[derive(Debug)]
pub struct DirDownload {
    id: EntityId,
    entry: Entry,
    peer_source: Hash,
    listing_pending: bool,
    no_source: bool,
    fault: Option<DownloadFault>,
}

impl DirDownload {
    pub fn new(id: EntityId, entry: Entry, peer_source: Hash) -> Self {
        debug_assert_eq!(entry.kind, EntryKind::Dir);
        Self {
            id,
            entry,
            peer_source,
            listing_pending: false,
            no_source: false,
            fault: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn peer_source(&self) -> Hash {
        self.peer_source
    }

    pub fn status(&self) -> DownloadStatus {
        if self.listing_pending {
            DownloadStatus::ListingRequested
        } else if let Some(fault) = self.fault {
            DownloadStatus::Error(fault)
        } else if self.no_source {
            DownloadStatus::NoSource
        } else {
            DownloadStatus::Queued
        }
    }

    /// Asks the source peer for the directory content. False if nothing was sent.
    pub fn retrieve_entries(&mut self, peers: &dyn PeerDirectory, events: &EventSender) -> bool {
        if self.listing_pending || self.fault.is_some() {
            return false;
        }
        let Some(handle) = peers.get_peer(&self.peer_source) else {
            self.no_source = true;
            return false;
        };
        self.no_source = false;
        self.listing_pending = true;

        let dir = self.id;
        let reply = Reply::new(events.clone(), move |result| CoreEvent::Listing { dir, result });
        tracing::debug!(
            dir = %dir,
            peer = %self.peer_source,
            name = %self.entry.name,
            "requesting directory listing"
        );
        handle.get_entries(&self.entry, reply);
        true
    }

    pub fn listing_failed(&mut self, error: &PeerError) {
        self.listing_pending = false;
        self.fault = Some(match error {
            PeerError::Unavailable => DownloadFault::PeerUnavailable,
            _ => DownloadFault::ListingFailed,
        });
    }

    /// Clears a failure so the listing is requested again.
    pub fn recover(&mut self) {
        self.fault = None;
        self.no_source = false;
    }

    pub fn populate_entry(&self) -> QueueRecord {
        QueueRecord {
            entry: self.entry.clone(),
            peer_id: self.peer_source,
            complete: false,
        }
    }
}

/// A file split into chunks, each fetched by its own [`ChunkTransfer`].
#[derive(Debug)]
pub struct FileDownload {
    id: EntityId,
    entry: Entry,
    peer_source: Hash,
    complete: bool,
    chunks: Vec<ChunkSlot>,
    transfers: BTreeMap<TransferId, ChunkTransfer>,
    hashes_pending: bool,
    /// A hash answer filled nothing; the next request waits for the retry timer.
    hashes_deferred: bool,
    no_source: bool,
    fault: Option<DownloadFault>,
}

impl FileDownload {
    pub fn new(
        id: EntityId,
        entry: Entry,
        peer_source: Hash,
        complete: bool,
        cache: &dyn FileCache,
    ) -> Self {
        debug_assert_eq!(entry.kind, EntryKind::File);
        let chunks = (0..entry.chunk_count())
            .map(|index| ChunkSlot {
                index,
                hash: entry
                    .chunk_hashes
                    .get(index)
                    .copied()
                    .filter(|h| !h.is_null()),
                done: false,
            })
            .collect();
        let mut file = Self {
            id,
            entry,
            peer_source,
            complete,
            chunks,
            transfers: BTreeMap::new(),
            hashes_pending: false,
            hashes_deferred: false,
            no_source: false,
            fault: None,
        };
        if complete {
            file.mark_cached_chunks(cache);
        }
        file
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn peer_source(&self) -> Hash {
        self.peer_source
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn chunks(&self) -> &[ChunkSlot] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn done_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.done).count()
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.done)
    }

    pub fn needs_hashes(&self) -> bool {
        self.chunks.iter().any(|c| !c.done && c.hash.is_none())
    }

    pub fn hashes_deferred(&self) -> bool {
        self.hashes_deferred
    }

    pub fn status(&self) -> DownloadStatus {
        if self.is_complete() {
            DownloadStatus::Complete
        } else if let Some(fault) = self.fault {
            DownloadStatus::Error(fault)
        } else if !self.transfers.is_empty() {
            DownloadStatus::Transferring
        } else if self.hashes_pending {
            DownloadStatus::RetrievingHashes
        } else if self.no_source {
            DownloadStatus::NoSource
        } else if self.chunks.iter().any(|c| !c.done && c.hash.is_some()) {
            DownloadStatus::Ready
        } else {
            DownloadStatus::Queued
        }
    }

    /// Starts a hash request to the source peer if one is needed and the peer's hash slot is free.
    ///
    /// Returns whether a request was issued.
    pub(crate) fn retrieve_hashes(&mut self, ctx: &mut DispatchCtx<'_>) -> bool {
        if self.hashes_pending
            || self.hashes_deferred
            || self.fault.is_some()
            || !self.needs_hashes()
        {
            return false;
        }
        let Some(handle) = ctx.peers.get_peer(&self.peer_source) else {
            self.no_source = true;
            return false;
        };
        self.no_source = false;
        if !ctx.hash_pool.try_acquire(self.peer_source) {
            return false;
        }
        self.hashes_pending = true;

        let (entity, peer) = (self.id, self.peer_source);
        let reply = Reply::new(ctx.events.clone(), move |result| CoreEvent::Hashes {
            entity,
            peer,
            result,
        });
        tracing::debug!(entity = %entity, peer = %peer, name = %self.entry.name, "requesting chunk hashes");
        handle.get_hashes(&self.entry, reply);
        true
    }

    /// Applies a hash answer. The caller has already released the hash slot.
    pub fn hashes_arrived(&mut self, result: PeerResult<Vec<Hash>>, cache: &dyn FileCache) {
        self.hashes_pending = false;
        match result {
            Ok(hashes) => {
                let mut filled = 0;
                for (slot, hash) in self.chunks.iter_mut().zip(hashes) {
                    if slot.hash.is_none() && !hash.is_null() {
                        slot.hash = Some(hash);
                        filled += 1;
                    }
                }
                self.mark_cached_chunks(cache);
                if self.is_complete() {
                    return;
                }
                if !self.chunks.iter().any(|c| !c.done && c.hash.is_some()) {
                    self.fault = Some(DownloadFault::HashesFailed);
                } else if filled == 0 && self.needs_hashes() {
                    tracing::debug!(entity = %self.id, "hash answer added nothing; retrying later");
                    self.hashes_deferred = true;
                }
            }
            Err(error) => {
                tracing::debug!(entity = %self.id, error = %error, "hash retrieval failed");
                self.fault = Some(match error {
                    PeerError::Unavailable => DownloadFault::PeerUnavailable,
                    _ => DownloadFault::HashesFailed,
                });
            }
        }
    }

    /// Next chunk to fetch: lowest index that is not done, not in flight and has a known hash.
    pub(crate) fn get_a_chunk_to_download(
        &mut self,
        ctx: &mut DispatchCtx<'_>,
    ) -> Option<DispatchableChunk> {
        if self.is_complete() || self.fault.is_some() {
            return None;
        }
        let Some(handle) = ctx.peers.get_peer(&self.peer_source) else {
            self.no_source = true;
            return None;
        };
        self.no_source = false;

        if self.needs_hashes() {
            self.retrieve_hashes(ctx);
        }

        let slot = *self
            .chunks
            .iter()
            .find(|c| !c.done && c.hash.is_some() && !self.is_assigned(c.index))?;
        let hash = slot.hash?;

        let offset = slot.index as u64 * CHUNK_SIZE;
        let len = CHUNK_SIZE.min(self.entry.size.saturating_sub(offset));
        let id = TransferId(*ctx.next_transfer);
        *ctx.next_transfer += 1;
        let request = ChunkRequest {
            file: self.entry.clone(),
            chunk_index: slot.index,
            hash,
            offset,
            len,
        };
        Some(DispatchableChunk {
            transfer: ChunkTransfer::new(id, self.id, self.peer_source, request),
            handle,
        })
    }

    pub fn has_transfer(&self, transfer: TransferId) -> bool {
        self.transfers.contains_key(&transfer)
    }

    fn is_assigned(&self, index: usize) -> bool {
        self.transfers.values().any(|t| t.chunk_index() == index)
    }

    /// Takes ownership of a transfer that was just started.
    pub fn track_transfer(&mut self, transfer: ChunkTransfer) {
        self.transfers.insert(transfer.id(), transfer);
    }

    pub fn on_progress(&mut self, transfer: TransferId, bytes: u64) {
        if let Some(t) = self.transfers.get_mut(&transfer) {
            t.on_progress(bytes);
        }
    }

    /// Ends one of this file's transfers. `None` if the transfer is not ours.
    pub fn chunk_finished(
        &mut self,
        transfer: TransferId,
        pool: &mut OccupancyPool,
        result: PeerResult<u64>,
    ) -> Option<TransferOutcome> {
        let t = self.transfers.remove(&transfer)?;
        let outcome = t.finish(pool, result);
        match &outcome {
            TransferOutcome::Finished { chunk_index, .. } => {
                if let Some(slot) = self.chunks.get_mut(*chunk_index) {
                    slot.done = true;
                }
            }
            TransferOutcome::Failed { error, .. } => {
                self.fault = Some(match error {
                    PeerError::Unavailable => DownloadFault::PeerUnavailable,
                    _ => DownloadFault::TransferFailed,
                });
            }
        }
        Some(outcome)
    }

    /// Hands over every live transfer; used when the entity leaves the queue.
    pub fn take_transfers(&mut self) -> Vec<ChunkTransfer> {
        std::mem::take(&mut self.transfers).into_values().collect()
    }

    /// Clears the error so the next scan retries.
    pub fn recover(&mut self) {
        self.fault = None;
        self.no_source = false;
        self.hashes_deferred = false;
    }

    pub fn download_rate(&self, now: Instant) -> u64 {
        self.transfers.values().map(|t| t.download_rate(now)).sum()
    }

    pub fn populate_entry(&self) -> QueueRecord {
        QueueRecord {
            entry: self.entry.clone(),
            peer_id: self.peer_source,
            complete: self.complete || self.chunks.iter().any(|c| c.done),
        }
    }

    fn mark_cached_chunks(&mut self, cache: &dyn FileCache) {
        let known: Vec<(usize, Hash)> = self
            .chunks
            .iter()
            .filter(|c| !c.done)
            .filter_map(|c| c.hash.map(|h| (c.index, h)))
            .collect();
        if known.is_empty() {
            return;
        }
        let hashes: Vec<Hash> = known.iter().map(|(_, h)| *h).collect();
        let present = cache.have_chunks(&hashes);
        for ((index, _), have) in known.iter().zip(present) {
            if have && let Some(slot) = self.chunks.get_mut(*index) {
                slot.done = true;
            }
        }
    }
}
