//! Seams to the rest of the application: peers, the local file cache, and the reply objects
//! async operations use to hand their results back to the download core.

use crate::download::types::{EntityId, Entry, TransferId};
use crate::hash::Hash;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The peer went away or refused the request.
    Unavailable,
    /// The reply object was dropped without an answer.
    Dropped,
    Failed(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "peer unavailable"),
            Self::Dropped => write!(f, "peer dropped the request"),
            Self::Failed(msg) => write!(f, "peer request failed: {msg}"),
        }
    }
}

impl std::error::Error for PeerError {}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// Completion notifications posted into the download core.
#[derive(Debug)]
pub enum CoreEvent {
    Listing {
        dir: EntityId,
        result: PeerResult<Vec<Entry>>,
    },
    Hashes {
        entity: EntityId,
        peer: Hash,
        result: PeerResult<Vec<Hash>>,
    },
    ChunkProgress {
        entity: EntityId,
        transfer: TransferId,
        bytes: u64,
    },
    ChunkFinished {
        entity: EntityId,
        transfer: TransferId,
        result: PeerResult<u64>,
    },
}

pub type EventSender = mpsc::UnboundedSender<CoreEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CoreEvent>;

type Wrap<T> = Box<dyn FnOnce(PeerResult<T>) -> CoreEvent + Send>;

/// One-shot answer channel bound to a request at dispatch time.
///
/// Dropping a `Reply` without calling [`Reply::send`] reports `PeerError::Dropped`, so the core
/// never waits on an answer that cannot come.
pub struct Reply<T> {
    inner: Option<(EventSender, Wrap<T>)>,
}

impl<T> Reply<T> {
    pub(crate) fn new(
        tx: EventSender,
        wrap: impl FnOnce(PeerResult<T>) -> CoreEvent + Send + 'static,
    ) -> Self {
        Self {
            inner: Some((tx, Box::new(wrap))),
        }
    }

    pub fn send(mut self, result: PeerResult<T>) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: PeerResult<T>) {
        if let Some((tx, wrap)) = self.inner.take()
            && tx.send(wrap(result)).is_err()
        {
            tracing::debug!("download core is gone; dropping peer reply");
        }
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.deliver(Err(PeerError::Dropped));
        }
    }
}

impl<T> std::fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

/// Cumulative byte counter for a running chunk transfer.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: EventSender,
    entity: EntityId,
    transfer: TransferId,
}

impl ProgressReporter {
    pub(crate) fn new(tx: EventSender, entity: EntityId, transfer: TransferId) -> Self {
        Self {
            tx,
            entity,
            transfer,
        }
    }

    /// `bytes` is the total received so far for this chunk.
    pub fn report(&self, bytes: u64) {
        let _ = self.tx.send(CoreEvent::ChunkProgress {
            entity: self.entity,
            transfer: self.transfer,
            bytes,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub file: Entry,
    pub chunk_index: usize,
    pub hash: Hash,
    pub offset: u64,
    pub len: u64,
}

/// A live remote peer.
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> Hash;

    fn get_entries(&self, dir: &Entry, reply: Reply<Vec<Entry>>);

    fn get_hashes(&self, file: &Entry, reply: Reply<Vec<Hash>>);

    /// Fetches one chunk. `reply` carries the number of bytes written to the local cache.
    fn get_chunk(&self, request: ChunkRequest, progress: ProgressReporter, reply: Reply<u64>);
}

pub trait PeerDirectory: Send + Sync {
    fn get_peer(&self, id: &Hash) -> Option<Arc<dyn PeerHandle>>;
}

/// The local file cache, as far as downloads are concerned.
pub trait FileCache: Send + Sync {
    /// One flag per hash: true if the chunk is already stored locally.
    fn have_chunks(&self, hashes: &[Hash]) -> Vec<bool>;

    /// Total bytes shared locally.
    fn amount(&self) -> u64;
}

/// Directory with no peers. Every entity stays in `NoSource` until real peers are wired in.
#[derive(Debug, Default)]
pub struct OfflinePeers;

impl PeerDirectory for OfflinePeers {
    fn get_peer(&self, _id: &Hash) -> Option<Arc<dyn PeerHandle>> {
        None
    }
}

#[derive(Debug, Default)]
pub struct EmptyCache;

impl FileCache for EmptyCache {
    fn have_chunks(&self, hashes: &[Hash]) -> Vec<bool> {
        vec![false; hashes.len()]
    }

    fn amount(&self) -> u64 {
        0
    }
}
