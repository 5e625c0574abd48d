//! The anchor directory: a hierarchical registry of live shard workers.
//!
//! Workers register a `Member` under an anchor path when they start serving
//! and unregister on exit. Clients list the path to build their topology and
//! watch it to learn about changes. Every path is treated as existing; an
//! untouched path is simply empty.

use crate::shard::Shard;
use crate::util::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Member is one worker's entry under an anchor path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub worker_id: String,
    pub shard: Shard,
}

#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// list returns the members under path ordered by worker id.
    async fn list(&self, path: &str) -> Result<Vec<Member>>;
    /// register adds member under path, replacing an entry with the same
    /// worker id.
    async fn register(&self, path: &str, member: Member) -> Result<()>;
    /// unregister removes the member with worker_id and reports whether it
    /// was present.
    async fn unregister(&self, path: &str, worker_id: &str) -> Result<bool>;
    /// watch yields the revision of path, bumped on every change under it.
    fn watch(&self, path: &str) -> Result<watch::Receiver<u64>>;
}

struct Dir {
    members: BTreeMap<String, Member>,
    rev: u64,
    rev_tx: watch::Sender<u64>,
    // keeps the channel open while nobody watches
    rev_rx: watch::Receiver<u64>,
}

impl Dir {
    fn new() -> Dir {
        let (rev_tx, rev_rx) = watch::channel(0);
        Dir {
            members: BTreeMap::new(),
            rev: 0,
            rev_tx,
            rev_rx,
        }
    }

    fn bump(&mut self) {
        self.rev += 1;
        let _ = self.rev_tx.send(self.rev);
    }
}

/// MemDirectory keeps the anchor tree in process memory.
#[derive(Default)]
pub struct MemDirectory {
    dirs: Mutex<HashMap<String, Dir>>,
}

/// Normalizes an anchor path: absolute, no trailing or doubled slashes.
fn clean_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::Config(format!("anchor path {:?} is not absolute", path)));
    }
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    Ok(format!("/{}", parts.join("/")))
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_dir<R>(&self, path: &str, f: impl FnOnce(&mut Dir) -> R) -> Result<R> {
        let path = clean_path(path)?;
        let mut dirs = self.dirs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(dirs.entry(path).or_insert_with(Dir::new)))
    }
}

#[async_trait]
impl Directory for MemDirectory {
    async fn list(&self, path: &str) -> Result<Vec<Member>> {
        self.with_dir(path, |dir| dir.members.values().cloned().collect())
    }

    async fn register(&self, path: &str, member: Member) -> Result<()> {
        self.with_dir(path, |dir| {
            tracing::debug!(
                worker = %member.worker_id,
                shard = %member.shard.key,
                "member registered"
            );
            dir.members.insert(member.worker_id.clone(), member);
            dir.bump();
        })
    }

    async fn unregister(&self, path: &str, worker_id: &str) -> Result<bool> {
        self.with_dir(path, |dir| {
            let removed = dir.members.remove(worker_id).is_some();
            if removed {
                tracing::debug!(worker = worker_id, "member unregistered");
                dir.bump();
            }
            removed
        })
    }

    fn watch(&self, path: &str) -> Result<watch::Receiver<u64>> {
        self.with_dir(path, |dir| dir.rev_rx.clone())
    }
}
