use crate::config::DownloadConfig;
use crate::download::errors::{DownloadError, DownloadStoreError};
use crate::download::manager::{DownloadManager, ManagerInbox, SchedulerConfig};
use crate::download::occupancy::PoolRole;
use crate::download::peer::{FileCache, PeerDirectory};
use crate::download::store::{self, LoadedQueue, load_queue, save_queue};
use crate::download::types::{AddOutcome, DownloadSummary, EntityId, Entry, QueuePosition};
use crate::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadServiceConfig {
    pub queue_file: PathBuf,
    pub scheduler: SchedulerConfig,
    /// `None` saves only on shutdown and on request.
    pub persist_every: Option<Duration>,
}

impl DownloadServiceConfig {
    pub fn from_data_dir(data_dir: &Path) -> Self {
        Self::from_config(data_dir, &DownloadConfig::default())
    }

    pub fn from_config(data_dir: &Path, cfg: &DownloadConfig) -> Self {
        Self {
            queue_file: data_dir.join(&cfg.queue_file),
            scheduler: cfg.scheduler(),
            persist_every: cfg.persist_every(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadServiceStatus {
    pub running: bool,
    pub queue_len: usize,
    pub in_flight: usize,
    pub completed_total: u64,
    /// `None` until the file cache reported ready and the saved queue was read.
    pub restored_on_start: Option<usize>,
    /// The saved queue could not be read; the session runs without it and does not overwrite it.
    pub queue_load_failed: bool,
    pub started_at: Instant,
}

#[derive(Debug)]
pub enum DownloadCommand {
    AddDownload {
        entry: Entry,
        peer: Hash,
        complete: bool,
        position: QueuePosition,
        reply: oneshot::Sender<AddOutcome>,
    },
    RemoveDownload {
        id: EntityId,
        reply: oneshot::Sender<bool>,
    },
    Downloads {
        reply: oneshot::Sender<Vec<DownloadSummary>>,
    },
    DownloadRate {
        reply: oneshot::Sender<u64>,
    },
    FileCacheLoaded {
        reply: oneshot::Sender<usize>,
    },
    PeerAvailable {
        peer: Hash,
        reply: oneshot::Sender<()>,
    },
    SetConfig {
        cfg: SchedulerConfig,
        reply: oneshot::Sender<()>,
    },
    SaveNow {
        reply: oneshot::Sender<std::result::Result<(), DownloadStoreError>>,
    },
    Ping {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<std::result::Result<(), DownloadStoreError>>,
    },
}

#[derive(Clone)]
pub struct DownloadServiceHandle {
    tx: mpsc::Sender<DownloadCommand>,
}

impl DownloadServiceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DownloadCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn add_download(&self, entry: Entry, peer: Hash, complete: bool) -> Result<AddOutcome> {
        self.add_download_at(entry, peer, complete, QueuePosition::End)
            .await
    }

    pub async fn add_download_at(
        &self,
        entry: Entry,
        peer: Hash,
        complete: bool,
        position: QueuePosition,
    ) -> Result<AddOutcome> {
        self.request(|reply| DownloadCommand::AddDownload {
            entry,
            peer,
            complete,
            position,
            reply,
        })
        .await
    }

    pub async fn remove_download(&self, id: EntityId) -> Result<bool> {
        self.request(|reply| DownloadCommand::RemoveDownload { id, reply })
            .await
    }

    pub async fn downloads(&self) -> Result<Vec<DownloadSummary>> {
        self.request(|reply| DownloadCommand::Downloads { reply })
            .await
    }

    /// Bytes per second over every transferring file.
    pub async fn download_rate(&self) -> Result<u64> {
        self.request(|reply| DownloadCommand::DownloadRate { reply })
            .await
    }

    /// The local cache is ready: the saved queue is read and re-queued. Returns how many entries
    /// were restored. Once a load succeeded, later calls restore nothing.
    ///
    /// A queue file that cannot be read is logged and reported through
    /// [`DownloadServiceStatus::queue_load_failed`], not returned as an error.
    pub async fn file_cache_loaded(&self) -> Result<usize> {
        self.request(|reply| DownloadCommand::FileCacheLoaded { reply })
            .await
    }

    pub async fn peer_available(&self, peer: Hash) -> Result<()> {
        self.request(|reply| DownloadCommand::PeerAvailable { peer, reply })
            .await
    }

    pub async fn set_config(&self, cfg: SchedulerConfig) -> Result<()> {
        self.request(|reply| DownloadCommand::SetConfig { cfg, reply })
            .await
    }

    pub async fn save_now(&self) -> Result<()> {
        Ok(self
            .request(|reply| DownloadCommand::SaveNow { reply })
            .await??)
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(|reply| DownloadCommand::Ping { reply }).await
    }

    /// Stops the service after saving the queue.
    pub async fn shutdown(&self) -> Result<()> {
        Ok(self
            .request(|reply| DownloadCommand::Shutdown { reply })
            .await??)
    }
}

pub async fn start_service(
    cfg: DownloadServiceConfig,
    peers: Arc<dyn PeerDirectory>,
    cache: Arc<dyn FileCache>,
) -> Result<(
    DownloadServiceHandle,
    watch::Receiver<DownloadServiceStatus>,
    tokio::task::JoinHandle<Result<()>>,
)> {
    ensure_dirs(&cfg).await?;
    let (mgr, inbox) = DownloadManager::new(cfg.scheduler.clone(), peers, cache);
    let (tx, rx) = mpsc::channel(128);
    let started_at = Instant::now();
    let (status_tx, status_rx) = watch::channel(DownloadServiceStatus {
        running: true,
        queue_len: 0,
        in_flight: 0,
        completed_total: 0,
        restored_on_start: None,
        queue_load_failed: false,
        started_at,
    });
    tracing::info!(
        queue_file = %cfg.queue_file.display(),
        max_transfers = cfg.scheduler.max_transfers,
        "download service started"
    );
    let service = DownloadService {
        cfg,
        mgr,
        status_tx,
        queue: QueueLoad::Pending,
        started_at,
    };
    let join = tokio::spawn(service.run(rx, inbox));
    Ok((DownloadServiceHandle { tx }, status_rx, join))
}

async fn ensure_dirs(cfg: &DownloadServiceConfig) -> Result<()> {
    if let Some(parent) = cfg.queue_file.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| DownloadStoreError::EnsureDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

/// Where the saved queue stands for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueLoad {
    Pending,
    Restored(usize),
    Failed,
}

struct DownloadService {
    cfg: DownloadServiceConfig,
    mgr: DownloadManager,
    status_tx: watch::Sender<DownloadServiceStatus>,
    queue: QueueLoad,
    started_at: Instant,
}

impl DownloadService {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<DownloadCommand>,
        mut inbox: ManagerInbox,
    ) -> Result<()> {
        let mut persist = self.cfg.persist_every.map(|every| {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick
        });

        loop {
            let backoff = self.mgr.backoff_deadline();
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!("download command channel closed");
                        break;
                    };
                    if let Some(reply) = self.handle_command(cmd).await {
                        let saved = self.save().await;
                        if let Err(err) = &saved {
                            tracing::error!(error = %err, "failed to save download queue on shutdown");
                        }
                        self.publish(false);
                        let _ = reply.send(saved);
                        return Ok(());
                    }
                }
                Some(ev) = inbox.events.recv() => self.mgr.handle_event(ev),
                freed = inbox.hash_freed.recv() => {
                    on_freed(&mut self.mgr, PoolRole::HashRetrieval, freed);
                }
                freed = inbox.chunk_freed.recv() => {
                    on_freed(&mut self.mgr, PoolRole::ChunkTransfer, freed);
                }
                _ = tokio::time::sleep_until(backoff.unwrap_or_else(tokio::time::Instant::now)),
                    if backoff.is_some() =>
                {
                    self.mgr.on_backoff_elapsed();
                }
                _ = next_tick(&mut persist), if persist.is_some() => {
                    if let Err(err) = self.save().await {
                        tracing::warn!(error = %err, "periodic download queue save failed");
                    }
                }
            }
            self.publish(true);
        }

        if let Err(err) = self.save().await {
            tracing::error!(error = %err, "failed to save download queue");
        }
        self.publish(false);
        Ok(())
    }

    /// Returns the shutdown reply when the command asks the service to stop.
    async fn handle_command(
        &mut self,
        cmd: DownloadCommand,
    ) -> Option<oneshot::Sender<std::result::Result<(), DownloadStoreError>>> {
        match cmd {
            DownloadCommand::AddDownload {
                entry,
                peer,
                complete,
                position,
                reply,
            } => {
                let outcome = self.mgr.add_download(entry, peer, complete, position);
                if matches!(outcome, AddOutcome::Queued(_)) {
                    self.mgr.scan_queue();
                }
                let _ = reply.send(outcome);
            }
            DownloadCommand::RemoveDownload { id, reply } => {
                let removed = self.mgr.remove_download(id);
                let _ = reply.send(removed);
            }
            DownloadCommand::Downloads { reply } => {
                let _ = reply.send(self.mgr.downloads());
            }
            DownloadCommand::DownloadRate { reply } => {
                let _ = reply.send(self.mgr.download_rate());
            }
            DownloadCommand::FileCacheLoaded { reply } => {
                let restored = self.restore().await;
                let _ = reply.send(restored);
            }
            DownloadCommand::PeerAvailable { peer, reply } => {
                self.mgr.on_peer_available(peer);
                let _ = reply.send(());
            }
            DownloadCommand::SetConfig { cfg, reply } => {
                self.cfg.scheduler = cfg.clone();
                self.mgr.set_config(cfg);
                let _ = reply.send(());
            }
            DownloadCommand::SaveNow { reply } => {
                let saved = self.save().await;
                let _ = reply.send(saved);
            }
            DownloadCommand::Ping { reply } => {
                let _ = reply.send(());
            }
            DownloadCommand::Shutdown { reply } => return Some(reply),
        }
        None
    }

    async fn restore(&mut self) -> usize {
        if let QueueLoad::Restored(_) = self.queue {
            tracing::debug!("file cache reported ready again; queue already restored");
            return 0;
        }
        let loaded = match load_queue(&self.cfg.queue_file).await {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!(
                    path = %self.cfg.queue_file.display(),
                    error = %err,
                    "saved download queue cannot be read; continuing without it"
                );
                self.queue = QueueLoad::Failed;
                return 0;
            }
        };
        let count = match loaded {
            LoadedQueue::Loaded { records, source } => {
                tracing::info!(
                    entries = records.len(),
                    source = ?source,
                    cached_bytes = self.mgr.file_cache().amount(),
                    "restoring download queue"
                );
                let count = self.mgr.restore(records);
                self.mgr.scan_queue();
                count
            }
            LoadedQueue::Missing | LoadedQueue::StaleVersion { .. } | LoadedQueue::Unreadable => 0,
        };
        self.queue = QueueLoad::Restored(count);
        count
    }

    /// Writes the queue, unless the saved one has not been read back.
    async fn save(&self) -> store::Result<()> {
        match self.queue {
            QueueLoad::Restored(_) => {}
            QueueLoad::Pending => {
                tracing::debug!("saved queue not loaded yet; skipping save");
                return Ok(());
            }
            QueueLoad::Failed => {
                tracing::warn!(
                    path = %self.cfg.queue_file.display(),
                    queued = self.mgr.len(),
                    "saved queue was never read; not overwriting it"
                );
                return Ok(());
            }
        }
        save_queue(&self.cfg.queue_file, &self.mgr.queue_records()).await
    }

    fn publish(&self, running: bool) {
        let next = DownloadServiceStatus {
            running,
            queue_len: self.mgr.len(),
            in_flight: self.mgr.in_flight(),
            completed_total: self.mgr.completed_total(),
            restored_on_start: match self.queue {
                QueueLoad::Restored(count) => Some(count),
                QueueLoad::Pending | QueueLoad::Failed => None,
            },
            queue_load_failed: self.queue == QueueLoad::Failed,
            started_at: self.started_at,
        };
        self.status_tx.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }
}

fn on_freed(
    mgr: &mut DownloadManager,
    role: PoolRole,
    freed: std::result::Result<Hash, broadcast::error::RecvError>,
) {
    match freed {
        Ok(peer) => mgr.on_peer_freed(role, peer),
        Err(broadcast::error::RecvError::Lagged(skipped)) => mgr.on_freed_lagged(role, skipped),
        // The pools live inside the manager, so their senders never close first.
        Err(broadcast::error::RecvError::Closed) => {}
    }
}

async fn next_tick(persist: &mut Option<tokio::time::Interval>) {
    match persist {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}
