pub mod app;
pub mod config;
pub mod config_io;
pub mod data_dir_lock;
pub mod download;
pub mod hash;
pub mod logging;
