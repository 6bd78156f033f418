use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue storage is not mounted")]
    Unmounted,

    #[error("queue has been closed for shutdown")]
    Closed,

    #[error("queue lock not acquired within {0:?}")]
    Busy(std::time::Duration),

    #[error("failed to serialize reading: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        QueueError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("preferences database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
