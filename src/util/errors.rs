use crate::server::ServerState;
use crate::shard::{Endpoint, ShardKey};
use std::result::Result as stdResult;
use thiserror::Error;

pub type Result<T> = stdResult<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("config error {0}")]
    Config(String),
    #[error("mount error {0}")]
    Mount(String),
    #[error("storage error {0}")]
    Storage(String),
    #[error("codec error {0}")]
    Codec(String),
    #[error("no shard available for key {0}")]
    NoShard(ShardKey),
    #[error("duplicate shard key {0}")]
    DuplicateShard(ShardKey),
    #[error("shard {endpoint} unreachable: {reason}")]
    ShardUnreachable { endpoint: Endpoint, reason: String },
    #[error("call to {0} timed out")]
    Timeout(Endpoint),
    #[error("shard server is {0:?}, not serving")]
    NotServing(ServerState),
    #[error("protocol error {0}")]
    Protocol(String),
    #[error("limiter closed")]
    LimiterClosed,
}

impl Error {
    pub fn unreachable(endpoint: &Endpoint, reason: impl ToString) -> Error {
        Error::ShardUnreachable {
            endpoint: endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// Transport-level failures, as opposed to errors the shard itself returned.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::ShardUnreachable { .. } | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Config(e.to_string())
    }
}
