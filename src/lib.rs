pub mod anchor;
pub mod client;
mod cluster;
pub mod codec;
pub mod config;
pub mod limiter;
pub mod node;
pub mod request;
pub mod server;
pub mod shard;
pub mod storage;
pub mod util;

pub use client::{AddRequest, Client, SpaceId};
pub use cluster::{LocalCluster, LocalServer, Worker};
pub use config::ClusterConfig;
pub use util::{Error, Result};
