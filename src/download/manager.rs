use crate::download::chunk::{ChunkTransfer, TransferOutcome};
use crate::download::entity::{DirDownload, DispatchCtx, DispatchableChunk, Download, FileDownload};
use crate::download::occupancy::{OccupancyPool, PoolRole};
use crate::download::peer::{
    CoreEvent, EventReceiver, EventSender, FileCache, PeerDirectory, PeerResult,
};
use crate::download::queue::DownloadQueue;
use crate::download::types::{
    AddOutcome, DownloadStatus, DownloadSummary, EntityId, Entry, EntryKind, QueuePosition,
    QueueRecord, TransferId,
};
use crate::hash::Hash;
use crate::logging::{WarnThrottle, redact_hex};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};

const NO_SOURCE_WARN_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Global cap on concurrent chunk transfers.
    pub max_transfers: usize,
    /// Delay before a pass that found only failing or sourceless entities is retried.
    pub rescan_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_transfers: 3,
            rescan_period: Duration::from_millis(5000),
        }
    }
}

/// Receiving side of the manager's notifications: completion events and both pools' freed
/// broadcasts. Kept apart from [`DownloadManager`] so an event loop can select on it while
/// holding the manager mutably.
#[derive(Debug)]
pub struct ManagerInbox {
    pub events: EventReceiver,
    pub hash_freed: broadcast::Receiver<Hash>,
    pub chunk_freed: broadcast::Receiver<Hash>,
}

impl ManagerInbox {
    /// Handles every notification already queued, including the ones produced while handling.
    pub fn drain(&mut self, mgr: &mut DownloadManager) -> usize {
        let mut handled = 0;
        loop {
            let before = handled;
            while let Ok(ev) = self.events.try_recv() {
                mgr.handle_event(ev);
                handled += 1;
            }
            handled += drain_freed(&mut self.hash_freed, mgr, PoolRole::HashRetrieval);
            handled += drain_freed(&mut self.chunk_freed, mgr, PoolRole::ChunkTransfer);
            if handled == before {
                return handled;
            }
        }
    }
}

fn drain_freed(
    rx: &mut broadcast::Receiver<Hash>,
    mgr: &mut DownloadManager,
    role: PoolRole,
) -> usize {
    let mut handled = 0;
    loop {
        match rx.try_recv() {
            Ok(peer) => {
                mgr.on_peer_freed(role, peer);
                handled += 1;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                mgr.on_freed_lagged(role, skipped);
                handled += 1;
            }
            Err(_) => return handled,
        }
    }
}

/// Owner of the download queue and everything scheduling touches.
///
/// All methods run on one task; asynchronous work reports back through [`ManagerInbox`].
pub struct DownloadManager {
    cfg: SchedulerConfig,
    peers: Arc<dyn PeerDirectory>,
    cache: Arc<dyn FileCache>,
    queue: DownloadQueue,
    hash_pool: OccupancyPool,
    chunk_pool: OccupancyPool,
    orphans: HashMap<TransferId, ChunkTransfer>,
    in_flight: usize,
    next_entity: u64,
    next_transfer: u64,
    backoff_deadline: Option<Instant>,
    completed_total: u64,
    events_tx: EventSender,
    no_source_warn: WarnThrottle<Hash>,
}

impl DownloadManager {
    pub fn new(
        cfg: SchedulerConfig,
        peers: Arc<dyn PeerDirectory>,
        cache: Arc<dyn FileCache>,
    ) -> (Self, ManagerInbox) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let hash_pool = OccupancyPool::new(PoolRole::HashRetrieval);
        let chunk_pool = OccupancyPool::new(PoolRole::ChunkTransfer);
        let inbox = ManagerInbox {
            events,
            hash_freed: hash_pool.subscribe(),
            chunk_freed: chunk_pool.subscribe(),
        };
        let mgr = Self {
            cfg,
            peers,
            cache,
            queue: DownloadQueue::new(),
            hash_pool,
            chunk_pool,
            orphans: HashMap::new(),
            in_flight: 0,
            next_entity: 1,
            next_transfer: 1,
            backoff_deadline: None,
            completed_total: 0,
            events_tx,
            no_source_warn: WarnThrottle::new(NO_SOURCE_WARN_INTERVAL),
        };
        (mgr, inbox)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn set_config(&mut self, cfg: SchedulerConfig) {
        let grew = cfg.max_transfers > self.cfg.max_transfers;
        tracing::info!(
            max_transfers = cfg.max_transfers,
            rescan_ms = cfg.rescan_period.as_millis() as u64,
            "download scheduler config updated"
        );
        self.cfg = cfg;
        if grew {
            self.scan_queue();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn completed_total(&self) -> u64 {
        self.completed_total
    }

    pub fn backoff_deadline(&self) -> Option<Instant> {
        self.backoff_deadline
    }

    pub fn hash_pool(&self) -> &OccupancyPool {
        &self.hash_pool
    }

    pub fn chunk_pool(&self) -> &OccupancyPool {
        &self.chunk_pool
    }

    pub fn file_cache(&self) -> &dyn FileCache {
        self.cache.as_ref()
    }

    /// Queues a file or directory. Entries already queued (same kind, path, name and size, from
    /// any peer) are ignored.
    pub fn add_download(
        &mut self,
        entry: Entry,
        peer_source: Hash,
        complete: bool,
        position: QueuePosition,
    ) -> AddOutcome {
        if self.queue.contains_target(&entry) {
            tracing::warn!(
                name = %entry.name,
                path = %entry.path,
                size = entry.size,
                "entry already queued; not adding it again"
            );
            return AddOutcome::Duplicate;
        }

        let id = EntityId(self.next_entity);
        self.next_entity += 1;

        match entry.kind {
            EntryKind::Dir => {
                let mut dir = DirDownload::new(id, entry, peer_source);
                if !dir.retrieve_entries(self.peers.as_ref(), &self.events_tx) {
                    self.arm_backoff();
                }
                self.queue.insert(position, Download::Dir(dir));
            }
            EntryKind::File => {
                let file = FileDownload::new(id, entry, peer_source, complete, self.cache.as_ref());
                tracing::debug!(
                    entity = %id,
                    name = %file.entry().name,
                    chunks = file.chunk_count(),
                    done = file.done_chunks(),
                    "file queued"
                );
                self.queue.insert(position, Download::File(file));
            }
        }
        AddOutcome::Queued(id)
    }

    /// Removes an entity. Its running transfers keep going as orphans until they report back.
    pub fn remove_download(&mut self, id: EntityId) -> bool {
        let Some((_, mut download)) = self.queue.remove(id) else {
            return false;
        };
        if let Some(file) = download.as_file_mut() {
            for t in file.take_transfers() {
                self.orphans.insert(t.id(), t);
            }
        }
        tracing::info!(entity = %id, name = %download.entry().name, "download removed");
        true
    }

    /// One pass over the queue, dispatching chunks until the transfer cap is reached.
    ///
    /// Returns the number of transfers started.
    pub fn scan_queue(&mut self) -> usize {
        tracing::trace!(in_flight = self.in_flight, queued = self.queue.len(), "scanning the queue");
        let cap = self.cfg.max_transfers;
        let now = Instant::now();
        let mut started = 0;
        let mut needs_backoff = false;
        let mut finished = Vec::new();

        for id in self.queue.ids() {
            if self.in_flight >= cap {
                break;
            }
            let Some(download) = self.queue.get_mut(id) else {
                continue;
            };
            let file = match download {
                Download::Dir(dir) => {
                    needs_backoff |= dir.status().needs_backoff();
                    continue;
                }
                Download::File(file) => file,
            };

            let mut ctx = DispatchCtx {
                peers: self.peers.as_ref(),
                hash_pool: &mut self.hash_pool,
                events: &self.events_tx,
                next_transfer: &mut self.next_transfer,
            };
            while self.in_flight < cap {
                let Some(DispatchableChunk {
                    mut transfer,
                    handle,
                }) = file.get_a_chunk_to_download(&mut ctx)
                else {
                    break;
                };
                if !transfer.start_downloading(&mut self.chunk_pool, handle.as_ref(), &self.events_tx)
                {
                    break;
                }
                file.track_transfer(transfer);
                self.in_flight += 1;
                started += 1;
            }

            needs_backoff |= file.hashes_deferred();
            let status = file.status();
            if status == DownloadStatus::Complete {
                finished.push(id);
            } else if status.needs_backoff() {
                needs_backoff = true;
                if status.is_transient()
                    && let Some(suppressed) = self.no_source_warn.allow(file.peer_source(), now)
                {
                    tracing::warn!(
                        peer = %redact_hex(&file.peer_source().to_hex()),
                        name = %file.entry().name,
                        suppressed,
                        "source peer not reachable; will retry"
                    );
                }
            }
        }

        for id in finished {
            if let Some((_, d)) = self.queue.remove(id) {
                self.completed_total += 1;
                tracing::info!(entity = %id, name = %d.entry().name, "download complete");
            }
        }
        if needs_backoff {
            self.arm_backoff();
        }
        debug_assert!(self.in_flight <= cap || started == 0);
        started
    }

    fn arm_backoff(&mut self) {
        if self.backoff_deadline.is_none() {
            self.backoff_deadline = Some(Instant::now() + self.cfg.rescan_period);
            tracing::debug!(
                after_ms = self.cfg.rescan_period.as_millis() as u64,
                "queue rescan scheduled"
            );
        }
    }

    /// Retry timer fired: failed entities get another chance, then the queue is scanned.
    pub fn on_backoff_elapsed(&mut self) -> usize {
        self.backoff_deadline = None;
        for id in self.queue.ids() {
            match self.queue.get_mut(id) {
                Some(Download::Dir(dir)) if dir.status().needs_backoff() => {
                    dir.recover();
                    dir.retrieve_entries(self.peers.as_ref(), &self.events_tx);
                }
                Some(Download::File(file))
                    if file.status().needs_backoff() || file.hashes_deferred() =>
                {
                    file.recover()
                }
                _ => {}
            }
        }
        self.scan_queue()
    }

    pub fn on_directory_listing_arrived(&mut self, dir_id: EntityId, result: PeerResult<Vec<Entry>>) {
        let Some(Download::Dir(dir)) = self.queue.get_mut(dir_id) else {
            tracing::debug!(dir = %dir_id, "listing for a directory no longer queued; discarded");
            return;
        };
        let children = match result {
            Ok(children) => children,
            Err(error) => {
                tracing::warn!(dir = %dir_id, error = %error, "directory listing failed; will retry");
                dir.listing_failed(&error);
                self.arm_backoff();
                return;
            }
        };

        let Some((index, removed)) = self.queue.remove(dir_id) else {
            return;
        };
        let peer_source = removed.peer_source();
        let total = children.len();
        let mut position = index;
        for child in children {
            if let AddOutcome::Queued(_) =
                self.add_download(child, peer_source, false, QueuePosition::At(position))
            {
                position += 1;
            }
        }
        tracing::info!(
            dir = %dir_id,
            name = %removed.entry().name,
            children = total,
            queued = position - index,
            "directory expanded"
        );
        self.scan_queue();
    }

    pub fn on_hashes_arrived(&mut self, entity: EntityId, peer: Hash, result: PeerResult<Vec<Hash>>) {
        self.hash_pool.release(peer);
        let deferred = match self.queue.get_mut(entity) {
            Some(Download::File(file)) => {
                file.hashes_arrived(result, self.cache.as_ref());
                file.hashes_deferred()
            }
            _ => {
                tracing::debug!(entity = %entity, "hashes for an entity no longer queued");
                return;
            }
        };
        if deferred {
            self.arm_backoff();
        }
        self.scan_queue();
    }

    pub fn on_chunk_progress(&mut self, entity: EntityId, transfer: TransferId, bytes: u64) {
        if let Some(Download::File(file)) = self.queue.get_mut(entity) {
            file.on_progress(transfer, bytes);
        } else if let Some(t) = self.orphans.get_mut(&transfer) {
            t.on_progress(bytes);
        }
    }

    pub fn on_chunk_transfer_finished(
        &mut self,
        entity: EntityId,
        transfer: TransferId,
        result: PeerResult<u64>,
    ) {
        let outcome = match self.queue.get_mut(entity) {
            Some(Download::File(file)) if file.has_transfer(transfer) => {
                file.chunk_finished(transfer, &mut self.chunk_pool, result)
            }
            _ => self
                .orphans
                .remove(&transfer)
                .map(|t| t.finish(&mut self.chunk_pool, result)),
        };
        let Some(outcome) = outcome else {
            tracing::warn!(entity = %entity, transfer = %transfer, "completion for an unknown transfer");
            return;
        };
        self.in_flight = self.in_flight.saturating_sub(1);
        match outcome {
            TransferOutcome::Finished { chunk_index, bytes } => {
                tracing::debug!(entity = %entity, transfer = %transfer, chunk = chunk_index, bytes, "chunk done");
            }
            TransferOutcome::Failed { chunk_index, error } => {
                tracing::warn!(entity = %entity, chunk = chunk_index, error = %error, "chunk transfer failed; will retry");
            }
        }
        self.scan_queue();
    }

    pub fn on_peer_freed(&mut self, role: PoolRole, peer: Hash) {
        tracing::trace!(role = role.as_str(), peer = %peer, in_flight = self.in_flight, "peer freed");
        match role {
            PoolRole::HashRetrieval => {
                self.retry_hash_retrieval();
            }
            PoolRole::ChunkTransfer => {
                self.scan_queue();
            }
        }
    }

    /// A freed-peer broadcast overflowed; act as if every peer was freed.
    pub fn on_freed_lagged(&mut self, role: PoolRole, skipped: u64) {
        tracing::debug!(role = role.as_str(), skipped, "missed peer freed notifications");
        match role {
            PoolRole::HashRetrieval => while self.retry_hash_retrieval() {},
            PoolRole::ChunkTransfer => {
                self.scan_queue();
            }
        }
    }

    /// First file (in queue order) that starts a hash request wins.
    fn retry_hash_retrieval(&mut self) -> bool {
        for id in self.queue.ids() {
            let Some(Download::File(file)) = self.queue.get_mut(id) else {
                continue;
            };
            let mut ctx = DispatchCtx {
                peers: self.peers.as_ref(),
                hash_pool: &mut self.hash_pool,
                events: &self.events_tx,
                next_transfer: &mut self.next_transfer,
            };
            if file.retrieve_hashes(&mut ctx) {
                return true;
            }
        }
        false
    }

    /// The peer directory reports a peer as reachable again.
    pub fn on_peer_available(&mut self, peer: Hash) -> usize {
        self.no_source_warn.forget(&peer);
        for id in self.queue.ids() {
            match self.queue.get_mut(id) {
                Some(Download::Dir(dir))
                    if dir.peer_source() == peer && dir.status().is_transient() =>
                {
                    dir.recover();
                    dir.retrieve_entries(self.peers.as_ref(), &self.events_tx);
                }
                Some(Download::File(file))
                    if file.peer_source() == peer && file.status().is_transient() =>
                {
                    file.recover();
                }
                _ => {}
            }
        }
        self.scan_queue()
    }

    pub fn handle_event(&mut self, ev: CoreEvent) {
        match ev {
            CoreEvent::Listing { dir, result } => self.on_directory_listing_arrived(dir, result),
            CoreEvent::Hashes {
                entity,
                peer,
                result,
            } => self.on_hashes_arrived(entity, peer, result),
            CoreEvent::ChunkProgress {
                entity,
                transfer,
                bytes,
            } => self.on_chunk_progress(entity, transfer, bytes),
            CoreEvent::ChunkFinished {
                entity,
                transfer,
                result,
            } => self.on_chunk_transfer_finished(entity, transfer, result),
        }
    }

    pub fn downloads(&self) -> Vec<DownloadSummary> {
        let now = Instant::now();
        self.queue.iter().map(|d| d.summary(now)).collect()
    }

    /// Sum of the instantaneous rates of files with live transfers, in bytes per second.
    pub fn download_rate(&self) -> u64 {
        let now = Instant::now();
        self.queue
            .iter()
            .filter_map(Download::as_file)
            .filter(|f| f.active_transfers() > 0)
            .map(|f| f.download_rate(now))
            .sum()
    }

    pub fn queue_records(&self) -> Vec<QueueRecord> {
        self.queue.iter().map(Download::populate_entry).collect()
    }

    /// Re-queues persisted records in order. Returns how many were accepted.
    pub fn restore(&mut self, records: Vec<QueueRecord>) -> usize {
        let total = records.len();
        let mut queued = 0;
        for rec in records {
            if let AddOutcome::Queued(_) =
                self.add_download(rec.entry, rec.peer_id, rec.complete, QueuePosition::End)
            {
                queued += 1;
            }
        }
        tracing::info!(records = total, queued, "download queue restored");
        queued
    }
}
