use std::path::PathBuf;

#[derive(Debug)]
pub enum DownloadStoreError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for DownloadStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to ensure directory '{}': {source}",
                    path.display()
                )
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write '{}': {source}", path.display())
            }
            Self::Copy { from, to, source } => write!(
                f,
                "failed to copy '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Remove { path, source } => {
                write!(f, "failed to remove '{}': {source}", path.display())
            }
            Self::Serialize { source } => write!(f, "failed to serialize download queue: {source}"),
            Self::Parse { path, source } => {
                write!(f, "failed to parse queue file '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for DownloadStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Copy { source, .. }
            | Self::Rename { source, .. }
            | Self::Remove { source, .. } => Some(source),
            Self::Serialize { source } | Self::Parse { source, .. } => Some(source),
        }
    }
}

#[derive(Debug)]
pub enum DownloadError {
    Store(DownloadStoreError),
    ChannelClosed,
    ServiceJoin(tokio::task::JoinError),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(source) => write!(f, "{source}"),
            Self::ChannelClosed => write!(f, "download service channel closed"),
            Self::ServiceJoin(source) => write!(f, "download service task join error: {source}"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(source) => Some(source),
            Self::ServiceJoin(source) => Some(source),
            Self::ChannelClosed => None,
        }
    }
}

impl From<DownloadStoreError> for DownloadError {
    fn from(value: DownloadStoreError) -> Self {
        Self::Store(value)
    }
}

impl From<tokio::task::JoinError> for DownloadError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::ServiceJoin(value)
    }
}
