use crate::codec::KeyOrder;
use crate::server::{ShardServerOptions, SyncPolicy, DEFAULT_SERVER_LIMIT, DEFAULT_SYNC_EVERY};
use crate::shard::{Endpoint, Shard, ShardKey};
use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ANCHOR: &str = "/xorshard/shards";
pub const DEFAULT_CLIENT_WRITES: usize = 80;
pub const DEFAULT_CLIENT_READS: usize = 20;
pub const DEFAULT_BATCH: usize = 10;

/// ClusterConfig describes a deployment: where the shards run and how they
/// store and serve data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Directory path the shard workers register under.
    #[serde(default = "default_anchor")]
    pub anchor: String,
    #[serde(default)]
    pub key_order: KeyOrder,
    #[serde(default = "default_sync_every")]
    pub sync_every: u64,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub fronts: Vec<FrontConfig>,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// `0x`-prefixed hex key; assigned at boot when absent.
    #[serde(default)]
    pub pivot: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub http: Option<u16>,
    /// Keep the shard in memory only when absent.
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    #[serde(default)]
    pub forget_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub client_writes: usize,
    pub client_reads: usize,
    pub batch: usize,
    pub server: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            client_writes: DEFAULT_CLIENT_WRITES,
            client_reads: DEFAULT_CLIENT_READS,
            batch: DEFAULT_BATCH,
            server: DEFAULT_SERVER_LIMIT,
        }
    }
}

fn default_anchor() -> String {
    DEFAULT_ANCHOR.to_owned()
}

fn default_sync_every() -> u64 {
    DEFAULT_SYNC_EVERY
}

impl ShardConfig {
    pub fn pivot(&self) -> Result<Option<ShardKey>> {
        self.pivot.as_deref().map(ShardKey::parse_hex).transpose()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }

    /// shard returns the shard this entry describes once it has a key.
    pub fn shard(&self, key: ShardKey) -> Shard {
        Shard {
            key,
            endpoint: self.endpoint(),
            aux_port: self.http,
        }
    }
}

impl ClusterConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        if !self.anchor.starts_with('/') {
            return Err(Error::Config(format!("anchor {:?} is not absolute", self.anchor)));
        }
        if self.sync_every == 0 {
            return Err(Error::Config("sync_every must be positive".to_owned()));
        }
        let limits = &self.limits;
        if limits.client_writes == 0
            || limits.client_reads == 0
            || limits.batch == 0
            || limits.server == 0
        {
            return Err(Error::Config("limits must be positive".to_owned()));
        }
        let mut pivots = HashSet::new();
        let mut endpoints = HashSet::new();
        for shard in &self.shards {
            if let Some(key) = shard.pivot()? {
                if !pivots.insert(key) {
                    return Err(Error::DuplicateShard(key));
                }
            }
            if !endpoints.insert(shard.endpoint()) {
                return Err(Error::Config(format!("endpoint {} listed twice", shard.endpoint())));
            }
        }
        Ok(())
    }

    /// Shards whose key is fixed by the configuration.
    pub fn static_shards(&self) -> Result<Vec<Shard>> {
        let mut shards = Vec::new();
        for shard in &self.shards {
            if let Some(key) = shard.pivot()? {
                shards.push(shard.shard(key));
            }
        }
        Ok(shards)
    }

    pub fn server_options(&self) -> ShardServerOptions {
        ShardServerOptions {
            order: self.key_order,
            sync: SyncPolicy::EveryNth(self.sync_every),
            limit: self.limits.server,
        }
    }
}
