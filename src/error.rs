use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("peer cache file error: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("handshake violation: {0}")]
    Handshake(String),

    #[error("connection refused by {0}")]
    Refused(String),

    #[error("peer {0} already connected")]
    AlreadyConnected(String),

    #[error("connection limit {0} reached")]
    LimitReached(usize),

    #[error("no push route recorded for search {0}")]
    NoPushRoute(String),

    #[error("directory {endpoint} failed: {reason}")]
    Directory { endpoint: String, reason: String },

    #[error("transfer of {file} failed: {reason}")]
    Transfer { file: String, reason: String },

    #[error("servent is {0}")]
    Lifecycle(String),
}

pub type Result<T> = std::result::Result<T, ServentError>;
