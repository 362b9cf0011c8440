//! Typed error kinds (spec §7). Background tasks log-and-continue on these;
//! only init errors propagate as `anyhow::Error` up through `main`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    #[error("key already acquired by another session")]
    AcquireConflict,

    #[error("watch stream closed")]
    WatchClosed,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid origin - this stream is already being uploaded from a different location")]
    InvalidOrigin,

    #[error("unknown stream")]
    UnknownStream,

    #[error("failed to parse playlist: {0}")]
    ParseFailure(String),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("authentication failed")]
    AuthFailure,

    #[error("upload exceeded size limit of {limit} bytes")]
    OversizeUpload { limit: u64 },
}
