//! A shard server owns one partition of the key space and the engine that
//! stores it.

use crate::codec::{KeyOrder, Point, RowKey, RowValue};
use crate::limiter::{Limiter, Session};
use crate::storage::{Engine, WriteOptions};
use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

mod service;
pub use service::{ShardRequest, ShardResponse};

/// Upper bound on the rows a single query returns.
pub const MAX_QUERY_ROWS: usize = 10_000;

pub const DEFAULT_SYNC_EVERY: u64 = 100;
pub const DEFAULT_SERVER_LIMIT: usize = 10;

/// States a mounted server moves through. A server that is not yet mounted
/// has no value at all: `mount` either returns one that is `Serving` or fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Serving,
    ShuttingDown,
    Closed,
}

/// SyncPolicy decides which writes are flushed to stable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Write number `w`, counting from zero, is synced iff `w % n == 0`.
    EveryNth(u64),
    /// A write is synced if at least this long has passed since the last
    /// synced one.
    Interval(Duration),
    Always,
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::EveryNth(DEFAULT_SYNC_EVERY)
    }
}

#[derive(Clone, Debug)]
pub struct ShardServerOptions {
    pub order: KeyOrder,
    pub sync: SyncPolicy,
    /// Requests served at once.
    pub limit: usize,
}

impl Default for ShardServerOptions {
    fn default() -> Self {
        ShardServerOptions {
            order: KeyOrder::default(),
            sync: SyncPolicy::default(),
            limit: DEFAULT_SERVER_LIMIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub writes: u64,
    pub synced_writes: u64,
    pub reads: u64,
    pub state: ServerState,
}

#[derive(Default)]
struct Counters {
    writes: u64,
    synced_writes: u64,
    reads: u64,
    last_sync: Option<Instant>,
}

pub struct ShardServer<E: Engine> {
    engine: E,
    order: KeyOrder,
    sync: SyncPolicy,
    state: Mutex<ServerState>,
    counters: Mutex<Counters>,
    // serializes read-modify-write against plain writes
    write_lock: Mutex<()>,
    // last update of every row written since mount, by encoded key
    touched: Mutex<HashMap<Vec<u8>, Instant>>,
    mounted_at: Instant,
    lmtr: Limiter,
}

impl<E: Engine> ShardServer<E> {
    /// mount opens the engine with `open` and starts serving. Any failure to
    /// open is reported as `Error::Mount`.
    pub fn mount<F>(options: ShardServerOptions, open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<E>,
    {
        tracing::info!(order = ?options.order, "mounting shard");
        let engine = open().map_err(|e| {
            let e = match e {
                Error::Mount(_) => e,
                other => Error::Mount(other.to_string()),
            };
            tracing::error!(error = %e, "shard mount failed");
            e
        })?;
        tracing::info!(sync = ?options.sync, limit = options.limit, "shard serving");
        Ok(ShardServer {
            engine,
            order: options.order,
            sync: options.sync,
            state: Mutex::new(ServerState::Serving),
            counters: Mutex::new(Counters::default()),
            write_lock: Mutex::new(()),
            touched: Mutex::new(HashMap::new()),
            mounted_at: Instant::now(),
            lmtr: Limiter::new(options.limit),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        tracing::info!(?state, "shard state changed");
    }

    pub fn order(&self) -> KeyOrder {
        self.order
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn check_serving(&self) -> Result<()> {
        match self.state() {
            ServerState::Serving => Ok(()),
            state => Err(Error::NotServing(state)),
        }
    }

    async fn session(&self) -> Result<Session> {
        self.check_serving()?;
        let session = self
            .lmtr
            .open()
            .await
            .map_err(|_| Error::NotServing(self.state()))?;
        self.check_serving()?;
        Ok(session)
    }

    fn write_options(&self) -> WriteOptions {
        let mut c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let sync = match self.sync {
            SyncPolicy::EveryNth(n) => c.writes % n.max(1) == 0,
            SyncPolicy::Interval(d) => c.last_sync.map_or(true, |at| at.elapsed() >= d),
            SyncPolicy::Always => true,
            SyncPolicy::Never => false,
        };
        c.writes += 1;
        if sync {
            c.synced_writes += 1;
            c.last_sync = Some(Instant::now());
        }
        WriteOptions { sync }
    }

    fn count_read(&self) {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reads += 1;
    }

    fn write(&self, key: RowKey, raw: &[u8]) -> Result<()> {
        let opts = self.write_options();
        let k = key.encode(self.order);
        self.engine.put(opts, &k, raw)?;
        self.touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(k.to_vec(), Instant::now());
        if opts.sync {
            tracing::debug!(partition = key.partition, secondary = key.secondary, "synced write");
        }
        Ok(())
    }

    fn read<V: RowValue>(&self, key: RowKey) -> Result<Option<V>> {
        self.count_read();
        match self.engine.get(&key.encode(self.order))? {
            Some(raw) => Ok(Some(V::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put<V: RowValue>(&self, key: RowKey, value: V) -> Result<()> {
        let _session = self.session().await?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(key, &value.encode())
    }

    /// add adds delta to the sum stored under key, a missing row counting as
    /// zero, and returns the new sum. A NaN delta is not applied and yields NaN.
    pub async fn add(&self, key: RowKey, delta: f64) -> Result<f64> {
        let _session = self.session().await?;
        if delta.is_nan() {
            return Ok(f64::NAN);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let sum = self.read::<f64>(key)?.unwrap_or(0.0) + delta;
        self.write(key, &sum.encode())?;
        Ok(sum)
    }

    pub async fn get<V: RowValue>(&self, key: RowKey) -> Result<Option<V>> {
        let _session = self.session().await?;
        self.read(key)
    }

    /// query_range returns the rows of partition with `min <= secondary < max`
    /// in the store's key order, at most `min(limit, MAX_QUERY_ROWS)` of them.
    pub async fn query_range<V: RowValue>(
        &self,
        partition: u64,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<Point<V>>> {
        let _session = self.session().await?;
        if min >= max {
            return Ok(Vec::new());
        }
        let start = match self.order {
            KeyOrder::Ascending => min,
            KeyOrder::Descending => max - 1,
        };
        self.scan(RowKey::new(partition, start), limit, |s| min <= s && s < max)
    }

    /// query_from returns rows of partition starting at pivot and moving in
    /// the store's key order.
    pub async fn query_from<V: RowValue>(
        &self,
        partition: u64,
        pivot: i64,
        limit: usize,
    ) -> Result<Vec<Point<V>>> {
        let _session = self.session().await?;
        self.scan(RowKey::new(partition, pivot), limit, |_| true)
    }

    fn scan<V, F>(&self, start: RowKey, limit: usize, within: F) -> Result<Vec<Point<V>>>
    where
        V: RowValue,
        F: Fn(i64) -> bool,
    {
        self.count_read();
        let limit = limit.min(MAX_QUERY_ROWS);
        let prefix = RowKey::partition_prefix(start.partition);
        let mut points = Vec::new();
        if limit == 0 {
            return Ok(points);
        }
        for kv in self.engine.seek(&start.encode(self.order))? {
            let (k, v) = kv?;
            if !k.starts_with(&prefix) {
                break;
            }
            let key = RowKey::decode(&k, self.order)?;
            if !within(key.secondary) {
                break;
            }
            points.push(Point {
                secondary: key.secondary,
                value: V::decode(&v)?,
            });
            if points.len() >= limit {
                break;
            }
        }
        Ok(points)
    }

    pub async fn stat(&self) -> Result<Stat> {
        let _session = self.session().await?;
        let c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Stat {
            writes: c.writes,
            synced_writes: c.synced_writes,
            reads: c.reads,
            state: self.state(),
        })
    }

    /// forget_before deletes every row last updated before cutoff and returns
    /// how many were removed. Rows found on disk at mount count as updated at
    /// mount time.
    pub async fn forget_before(&self, cutoff: Instant) -> Result<usize> {
        let _session = self.session().await?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stale = Vec::new();
        {
            let touched = self.touched.lock().unwrap_or_else(PoisonError::into_inner);
            for kv in self.engine.seek(&[])? {
                let (k, _) = kv?;
                let updated = touched.get(&k).copied().unwrap_or(self.mounted_at);
                if updated < cutoff {
                    stale.push(k);
                }
            }
        }
        for k in &stale {
            self.engine.del(WriteOptions::NO_SYNC, k)?;
            self.touched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(k);
        }
        if !stale.is_empty() {
            self.engine.sync()?;
            if let Err(e) = self.engine.compact() {
                tracing::warn!(error = %e, "compaction after forget failed");
            }
        }
        Ok(stale.len())
    }

    /// shutdown stops accepting requests, lets in-flight ones finish, then
    /// syncs and closes the engine. Calling it again does nothing.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ServerState::Serving {
                return Ok(());
            }
            *state = ServerState::ShuttingDown;
        }
        tracing::info!(pending = self.lmtr.pending(), "shard shutting down");
        self.lmtr.close();
        self.lmtr.wait().await;
        let closed = self.engine.sync().and_then(|_| self.engine.close());
        if let Err(e) = &closed {
            tracing::error!(error = %e, "shard close failed");
        }
        self.set_state(ServerState::Closed);
        closed
    }
}

impl<E: Engine> ShardServer<E> {
    /// spawn_forget_loop sweeps out rows not updated for `forget`, checking
    /// every `forget / 20`. The loop ends with the server.
    pub fn spawn_forget_loop(self: &Arc<Self>, forget: Duration) -> JoinHandle<()> {
        let server = Arc::downgrade(self);
        let period = (forget / 20).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let server = match server.upgrade() {
                    Some(server) => server,
                    None => return,
                };
                if server.state() != ServerState::Serving {
                    return;
                }
                let cutoff = match Instant::now().checked_sub(forget) {
                    Some(cutoff) => cutoff,
                    None => continue,
                };
                match server.forget_before(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "forgot stale rows"),
                    Err(e) => tracing::warn!(error = %e, "forget sweep failed"),
                }
            }
        })
    }
}
