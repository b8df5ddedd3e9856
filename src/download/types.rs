use crate::hash::Hash;
use serde::{Deserialize, Serialize};

/// Size of one transfer unit. The last chunk of a file may be shorter.
pub const CHUNK_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
}

/// Descriptor of a remote (or local) file or directory.
///
/// Produced by the peer listing or by the local cache; the download core never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub shared_dir: Option<Hash>,
    /// Known chunk hashes, in chunk order. May be empty or shorter than the chunk count.
    #[serde(default)]
    pub chunk_hashes: Vec<Hash>,
}

impl Entry {
    pub fn file(path: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            path: path.into(),
            name: name.into(),
            size,
            shared_dir: None,
            chunk_hashes: Vec::new(),
        }
    }

    pub fn dir(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Dir,
            path: path.into(),
            name: name.into(),
            size: 0,
            shared_dir: None,
            chunk_hashes: Vec::new(),
        }
    }

    pub fn with_chunk_hashes(mut self, hashes: Vec<Hash>) -> Self {
        self.chunk_hashes = hashes;
        self
    }

    /// Two entries with the same kind, path, name and size are the same download.
    pub fn same_target(&self, other: &Entry) -> bool {
        self.kind == other.kind
            && self.path == other.path
            && self.name == other.name
            && self.size == other.size
    }

    pub fn chunk_count(&self) -> usize {
        if self.kind == EntryKind::Dir {
            return 0;
        }
        self.size.div_ceil(CHUNK_SIZE) as usize
    }
}

/// Where `add_download` inserts a new entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePosition {
    #[default]
    End,
    At(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Queued(EntityId),
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFault {
    PeerUnavailable,
    HashesFailed,
    TransferFailed,
    ListingFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "fault")]
pub enum DownloadStatus {
    Queued,
    ListingRequested,
    RetrievingHashes,
    Ready,
    Transferring,
    Complete,
    /// Source peer not resolvable yet. Transient.
    NoSource,
    /// A request to the source failed.
    Error(DownloadFault),
}

impl DownloadStatus {
    /// Whether a scan pass that found this status should arm the retry timer.
    pub fn needs_backoff(self) -> bool {
        matches!(self, Self::NoSource | Self::Error(_))
    }

    pub fn is_transient(self) -> bool {
        matches!(self, Self::NoSource)
    }
}

/// One persisted queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub entry: Entry,
    pub peer_id: Hash,
    #[serde(default)]
    pub complete: bool,
}

/// Read-only view of one queued entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub id: EntityId,
    pub kind: EntryKind,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub peer_source: Hash,
    pub status: DownloadStatus,
    pub chunk_count: usize,
    pub done_chunks: usize,
    pub active_transfers: usize,
    pub download_rate: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(Entry::file("/", "a", 0).chunk_count(), 0);
        assert_eq!(Entry::file("/", "a", 1).chunk_count(), 1);
        assert_eq!(Entry::file("/", "a", CHUNK_SIZE).chunk_count(), 1);
        assert_eq!(Entry::file("/", "a", CHUNK_SIZE + 1).chunk_count(), 2);
        assert_eq!(Entry::file("/", "a", 3 * CHUNK_SIZE).chunk_count(), 3);
        assert_eq!(Entry::dir("/", "d").chunk_count(), 0);
    }

    #[test]
    fn same_target_ignores_hashes_and_shared_dir() {
        let a = Entry::file("/x/", "a.bin", 10);
        let mut b = a.clone().with_chunk_hashes(vec![Hash::new([1u8; 20])]);
        b.shared_dir = Some(Hash::new([2u8; 20]));
        assert!(a.same_target(&b));
        assert!(!a.same_target(&Entry::file("/x/", "a.bin", 11)));
        assert!(!a.same_target(&Entry::file("/y/", "a.bin", 10)));
        let mut d = a.clone();
        d.kind = EntryKind::Dir;
        assert!(!a.same_target(&d));
    }

    #[test]
    fn backoff_covers_no_source_and_errors_only() {
        assert!(DownloadStatus::NoSource.needs_backoff());
        assert!(DownloadStatus::Error(DownloadFault::TransferFailed).needs_backoff());
        assert!(!DownloadStatus::Ready.needs_backoff());
        assert!(!DownloadStatus::Transferring.needs_backoff());
        assert!(DownloadStatus::NoSource.is_transient());
        assert!(!DownloadStatus::Error(DownloadFault::PeerUnavailable).is_transient());
    }
}
