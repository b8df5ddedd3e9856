use crate::download::manager::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_number_of_downloaders() -> usize {
    3
}
fn default_rescan_period_if_error_ms() -> u64 {
    5000
}
fn default_persist_every_secs() -> u64 {
    // 0 = only save on shutdown.
    60
}
fn default_queue_file() -> String {
    "queue.json".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Global cap on concurrent chunk transfers.
    pub number_of_downloaders: usize,
    /// Delay before retrying entities whose source was missing or failed.
    pub rescan_period_if_error_ms: u64,
    pub persist_every_secs: u64,
    /// Relative paths are resolved against `general.data_dir`.
    pub queue_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            number_of_downloaders: default_number_of_downloaders(),
            rescan_period_if_error_ms: default_rescan_period_if_error_ms(),
            persist_every_secs: default_persist_every_secs(),
            queue_file: default_queue_file(),
        }
    }
}

impl DownloadConfig {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_transfers: self.number_of_downloaders,
            rescan_period: Duration::from_millis(self.rescan_period_if_error_ms),
        }
    }

    pub fn persist_every(&self) -> Option<Duration> {
        (self.persist_every_secs > 0).then(|| Duration::from_secs(self.persist_every_secs))
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) general.log_level
    // 3) info
    //
    // Example:
    // RUST_LOG=info,rust_lanshare::download=debug

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).expect("serialize");
        assert!(text.contains("number_of_downloaders = 3"));
        let back: Config = toml::from_str(&text).expect("parse");
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_keys_take_defaults() {
        let cfg: Config = toml::from_str("[download]\nnumber_of_downloaders = 5\n").expect("parse");
        assert_eq!(cfg.download.number_of_downloaders, 5);
        assert_eq!(cfg.download.rescan_period_if_error_ms, 5000);
        assert_eq!(cfg.download.queue_file, "queue.json");
        assert_eq!(cfg.general, GeneralConfig::default());
    }

    #[test]
    fn download_section_maps_to_scheduler() {
        let mut d = DownloadConfig::default();
        assert_eq!(d.scheduler(), SchedulerConfig::default());
        assert_eq!(d.persist_every(), Some(Duration::from_secs(60)));
        d.persist_every_secs = 0;
        assert_eq!(d.persist_every(), None);
    }
}
