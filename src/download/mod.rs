pub mod chunk;
pub mod entity;
pub mod errors;
pub mod manager;
pub mod occupancy;
pub mod peer;
pub mod queue;
pub mod service;
pub mod store;
pub mod types;

pub use errors::{DownloadError, DownloadStoreError};
pub use manager::{DownloadManager, ManagerInbox, SchedulerConfig};
pub use peer::{
    ChunkRequest, FileCache, PeerDirectory, PeerError, PeerHandle, PeerResult, ProgressReporter,
    Reply,
};
pub use service::{
    DownloadCommand, DownloadServiceConfig, DownloadServiceHandle, DownloadServiceStatus,
    start_service,
};
pub use store::{LoadedQueue, LoadedQueueSource, QUEUE_FILE_VERSION};
pub use types::{
    AddOutcome, CHUNK_SIZE, DownloadStatus, DownloadSummary, EntityId, Entry, EntryKind,
    QueuePosition, QueueRecord,
};
