use crate::download::errors::DownloadStoreError;
use crate::download::types::QueueRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, DownloadStoreError>;

/// Bumped whenever the record layout changes; older files are discarded on load.
pub const QUEUE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueFile {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<QueueRecord>,
}

/// Which copy of the queue file a load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedQueueSource {
    Primary,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedQueue {
    /// No queue file yet (first run).
    Missing,
    /// The file had another version and was removed.
    StaleVersion { found: u32, expected: u32 },
    /// Neither the file nor its backup could be parsed.
    Unreadable,
    Loaded {
        records: Vec<QueueRecord>,
        source: LoadedQueueSource,
    },
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

pub async fn save_queue(path: &Path, records: &[QueueRecord]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| DownloadStoreError::EnsureDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let file = QueueFile {
        version: QUEUE_FILE_VERSION,
        entries: records.to_vec(),
    };
    let bytes = serde_json::to_vec_pretty(&file)
        .map_err(|source| DownloadStoreError::Serialize { source })?;

    if path.exists() {
        let bak = backup_path(path);
        tokio::fs::copy(path, &bak)
            .await
            .map_err(|source| DownloadStoreError::Copy {
                from: path.to_path_buf(),
                to: bak,
                source,
            })?;
    }

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|source| DownloadStoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| DownloadStoreError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        })?;
    tracing::debug!(path = %path.display(), entries = records.len(), "download queue saved");
    Ok(())
}

/// Reads the persisted queue.
///
/// Only I/O failures other than "not found" and a failed removal of a stale file are errors;
/// every other outcome is reported through [`LoadedQueue`].
pub async fn load_queue(path: &Path) -> Result<LoadedQueue> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(source) => {
            return Err(DownloadStoreError::ReadFile {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let Some(bytes) = bytes else {
        if backup_path(path).exists() {
            return Ok(load_backup(path, None).await);
        }
        tracing::warn!(path = %path.display(), "no download queue file; starting with an empty queue");
        return Ok(LoadedQueue::Missing);
    };

    if let Ok(probe) = serde_json::from_slice::<VersionProbe>(&bytes)
        && probe.version != QUEUE_FILE_VERSION
    {
        tracing::error!(
            path = %path.display(),
            found = probe.version,
            expected = QUEUE_FILE_VERSION,
            "queue file version mismatch; discarding it"
        );
        remove_if_exists(path).await?;
        remove_if_exists(&backup_path(path)).await?;
        return Ok(LoadedQueue::StaleVersion {
            found: probe.version,
            expected: QUEUE_FILE_VERSION,
        });
    }

    match parse_queue(path, &bytes) {
        Ok(records) => Ok(LoadedQueue::Loaded {
            records,
            source: LoadedQueueSource::Primary,
        }),
        Err(err) => Ok(load_backup(path, Some(err)).await),
    }
}

async fn load_backup(path: &Path, primary_err: Option<DownloadStoreError>) -> LoadedQueue {
    let bak = backup_path(path);
    let parsed = match tokio::fs::read(&bak).await {
        Ok(bytes) => parse_queue(&bak, &bytes).map(|records| {
            let current = serde_json::from_slice::<VersionProbe>(&bytes)
                .is_ok_and(|p| p.version == QUEUE_FILE_VERSION);
            current.then_some(records)
        }),
        Err(source) => Err(DownloadStoreError::ReadFile { path: bak, source }),
    };
    match parsed {
        Ok(Some(records)) => {
            tracing::warn!(
                path = %path.display(),
                primary_error = primary_err.as_ref().map(|e| e.to_string()),
                "download queue restored from backup"
            );
            LoadedQueue::Loaded {
                records,
                source: LoadedQueueSource::Backup,
            }
        }
        Ok(None) => {
            tracing::warn!(path = %path.display(), "queue backup has another version; ignored");
            LoadedQueue::Unreadable
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                primary_error = primary_err.as_ref().map(|e| e.to_string()),
                backup_error = %err,
                "download queue cannot be read; starting with an empty queue"
            );
            LoadedQueue::Unreadable
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DownloadStoreError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_queue(path: &Path, bytes: &[u8]) -> Result<Vec<QueueRecord>> {
    serde_json::from_slice::<QueueFile>(bytes)
        .map(|f| f.entries)
        .map_err(|source| DownloadStoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::Entry;
    use crate::hash::Hash;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-lanshare-queue-store-{tag}-{nanos}"));
        p
    }

    fn sample_records() -> Vec<QueueRecord> {
        vec![
            QueueRecord {
                entry: Entry::dir("/music/", "album"),
                peer_id: Hash::new([1u8; 20]),
                complete: false,
            },
            QueueRecord {
                entry: Entry::file("/", "a.bin", 12345)
                    .with_chunk_hashes(vec![Hash::new([7u8; 20])]),
                peer_id: Hash::new([2u8; 20]),
                complete: true,
            },
        ]
    }

    #[tokio::test]
    async fn save_and_load_keep_order_and_flags() {
        let root = temp_dir("roundtrip");
        let path = root.join("nested").join("queue.json");

        save_queue(&path, &sample_records()).await.expect("save");
        let loaded = load_queue(&path).await.expect("load");
        assert_eq!(
            loaded,
            LoadedQueue::Loaded {
                records: sample_records(),
                source: LoadedQueueSource::Primary,
            }
        );
        assert!(!tmp_path(&path).exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_file_is_first_run() {
        let root = temp_dir("missing");
        let loaded = load_queue(&root.join("queue.json")).await.expect("load");
        assert_eq!(loaded, LoadedQueue::Missing);
    }

    #[tokio::test]
    async fn stale_version_removes_the_file_and_its_backup() {
        let root = temp_dir("stale");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = root.join("queue.json");
        tokio::fs::write(&path, br#"{"version": 0, "entries": []}"#)
            .await
            .expect("write");
        tokio::fs::write(backup_path(&path), br#"{"version": 0, "entries": []}"#)
            .await
            .expect("write bak");

        let loaded = load_queue(&path).await.expect("load");
        assert_eq!(
            loaded,
            LoadedQueue::StaleVersion {
                found: 0,
                expected: QUEUE_FILE_VERSION
            }
        );
        assert!(!path.exists());
        assert!(!backup_path(&path).exists());
        assert_eq!(load_queue(&path).await.expect("reload"), LoadedQueue::Missing);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let root = temp_dir("fallback");
        let path = root.join("queue.json");

        save_queue(&path, &sample_records()[..1]).await.expect("save 1");
        save_queue(&path, &sample_records()).await.expect("save 2");
        // The backup holds the previous save.
        tokio::fs::write(&path, b"{not-json")
            .await
            .expect("write corrupt");

        let loaded = load_queue(&path).await.expect("load");
        assert_eq!(
            loaded,
            LoadedQueue::Loaded {
                records: sample_records()[..1].to_vec(),
                source: LoadedQueueSource::Backup,
            }
        );

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn unreadable_when_both_copies_are_corrupt() {
        let root = temp_dir("unreadable");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = root.join("queue.json");
        tokio::fs::write(&path, b"garbage").await.expect("write");
        tokio::fs::write(backup_path(&path), b"also garbage")
            .await
            .expect("write bak");

        assert_eq!(load_queue(&path).await.expect("load"), LoadedQueue::Unreadable);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn records_without_complete_flag_default_to_false() {
        let root = temp_dir("default-flag");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = root.join("queue.json");
        let records = sample_records();
        let mut value = serde_json::to_value(QueueFile {
            version: QUEUE_FILE_VERSION,
            entries: records.clone(),
        })
        .expect("to value");
        value["entries"][1]
            .as_object_mut()
            .expect("object")
            .remove("complete");
        tokio::fs::write(&path, serde_json::to_vec(&value).expect("bytes"))
            .await
            .expect("write");

        let LoadedQueue::Loaded { records: loaded, .. } = load_queue(&path).await.expect("load")
        else {
            panic!("queue not loaded");
        };
        assert!(!loaded[1].complete);
        assert_eq!(loaded[1].entry, records[1].entry);

        let _ = std::fs::remove_dir_all(root);
    }
}
