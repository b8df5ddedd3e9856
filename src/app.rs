use crate::{
    config::Config,
    download::{
        DownloadServiceConfig, DownloadServiceStatus,
        peer::{EmptyCache, OfflinePeers},
        start_service,
    },
    data_dir_lock::DataDirLock,
};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        log = %config.general.log_level,
        data_dir = %config.general.data_dir,
        "starting app"
    );

    let data_dir = Path::new(&config.general.data_dir);
    let lock = DataDirLock::acquire(data_dir)?;
    tracing::debug!(path = %lock.path().display(), "data dir locked");

    let svc_cfg = DownloadServiceConfig::from_config(data_dir, &config.download);
    // Transport and cache are provided by the embedding client; standalone, the queue is kept and
    // persisted but no peer is reachable.
    let (handle, mut status_rx, join) =
        start_service(svc_cfg, Arc::new(OfflinePeers), Arc::new(EmptyCache))
            .await
            .context("failed to start download service")?;

    match handle.file_cache_loaded().await {
        Ok(restored) => tracing::info!(restored, "download queue ready"),
        Err(err) => tracing::error!(error = %err, "download queue was not restored"),
    }
    tracing::info!("press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received Ctrl+C");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    tracing::warn!("download service stopped on its own");
                    break;
                }
                log_status(&status_rx);
            }
        }
    }

    tracing::info!("shutting down gracefully");
    if let Err(err) = handle.shutdown().await {
        tracing::warn!(error = %err, "download service shutdown request failed");
    }
    join.await??;
    drop(lock);
    Ok(())
}

fn log_status(rx: &watch::Receiver<DownloadServiceStatus>) {
    let status = rx.borrow();
    tracing::debug!(
        queued = status.queue_len,
        in_flight = status.in_flight,
        completed = status.completed_total,
        uptime_secs = status.started_at.elapsed().as_secs(),
        "download status"
    );
}
