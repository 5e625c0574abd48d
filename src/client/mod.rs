//! The client router: hashes application keys into the XOR space, finds the
//! owning shard and calls it under the client's rate limits.

use crate::anchor::Directory;
use crate::codec::{BackPointer, Point, RowKey};
use crate::config::{ClusterConfig, Limits};
use crate::limiter::Limiter;
use crate::request::{Dialer, Sender};
use crate::server::{ShardRequest, ShardResponse, Stat};
use crate::shard::{Endpoint, Shard, ShardKey, Topology, XorMetric};
use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use xxhash_rust::xxh3::xxh3_64;

/// SpaceId identifies one series: a metric name plus its tags, or any
/// application key hashed into the XOR space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpaceId(pub u64);

fn hash32(s: &str) -> u32 {
    xxh3_64(s.trim().as_bytes()) as u32
}

impl SpaceId {
    /// hash derives the id of metric with tags. Whitespace around names and
    /// values is ignored, as is the order of the tags; for a repeated tag the
    /// last value counts.
    pub fn hash<I, K, V>(metric: &str, tags: I) -> SpaceId
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let tags: BTreeMap<u32, u32> = tags
            .into_iter()
            .map(|(k, v)| (hash32(k.as_ref()), hash32(v.as_ref())))
            .collect();
        let mut buf = Vec::with_capacity(4 + 8 * tags.len());
        buf.extend_from_slice(&hash32(metric).to_be_bytes());
        for (tag, value) in tags {
            buf.extend_from_slice(&tag.to_be_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
        SpaceId(xxh3_64(&buf))
    }

    pub fn from_bytes(key: &[u8]) -> SpaceId {
        SpaceId(xxh3_64(key))
    }

    pub fn shard_key(self) -> ShardKey {
        ShardKey(self.0)
    }

    pub fn row(self, secondary: i64) -> RowKey {
        RowKey::new(self.0, secondary)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AddRequest {
    pub space: SpaceId,
    pub secondary: i64,
    pub delta: f64,
}

pub struct Client<D: Dialer> {
    anchor: String,
    directory: Option<Arc<dyn Directory>>,
    dialer: D,
    topology: Topology<Shard>,
    conns: Mutex<HashMap<Endpoint, D::Conn>>,
    writes: Limiter,
    reads: Limiter,
    batch_limit: usize,
}

impl<D: Dialer> Client<D> {
    fn build(
        anchor: String,
        directory: Option<Arc<dyn Directory>>,
        dialer: D,
        topology: Topology<Shard>,
        limits: Limits,
    ) -> Self {
        Client {
            anchor,
            directory,
            dialer,
            topology,
            conns: Mutex::new(HashMap::new()),
            writes: Limiter::new(limits.client_writes),
            reads: Limiter::new(limits.client_reads),
            batch_limit: limits.batch,
        }
    }

    /// new builds a client that learns its shards from the anchor directory.
    pub async fn new(
        config: &ClusterConfig,
        dialer: D,
        directory: Arc<dyn Directory>,
    ) -> Result<Self> {
        let client = Self::build(
            config.anchor.clone(),
            Some(directory),
            dialer,
            Topology::default(),
            config.limits,
        );
        client.refresh().await?;
        Ok(client)
    }

    /// with_shards builds a client over a fixed set of shards.
    pub fn with_shards(shards: Vec<Shard>, dialer: D) -> Result<Self> {
        Ok(Self::build(
            String::new(),
            None,
            dialer,
            Topology::populate(shards)?,
            Limits::default(),
        ))
    }

    pub fn topology(&self) -> &Topology<Shard> {
        &self.topology
    }

    /// Shard currently owning space.
    pub fn locate(&self, space: SpaceId) -> Result<Shard> {
        let key = space.shard_key();
        self.topology.find(key).ok_or(Error::NoShard(key))
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<D::Conn> {
        let cached = self
            .conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self.dialer.dial(endpoint).await?;
        tracing::debug!(%endpoint, "dialed shard");
        Ok(self
            .conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.clone())
            .or_insert(conn)
            .clone())
    }

    fn evict(&self, endpoint: &Endpoint) {
        let conn = self
            .conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
        if let Some(conn) = conn {
            conn.close();
        }
    }

    async fn call(
        &self,
        lmtr: &Limiter,
        key: ShardKey,
        req: ShardRequest,
    ) -> Result<ShardResponse> {
        let shard = self.topology.find(key).ok_or(Error::NoShard(key))?;
        let _session = lmtr.open().await?;
        let sent = match self.connect(&shard.endpoint).await {
            Ok(conn) => conn.send(req).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &sent {
            if e.is_unreachable() {
                // No rerouting: the key belongs to this shard until the
                // topology says otherwise.
                tracing::warn!(
                    shard = %shard.key,
                    endpoint = %shard.endpoint,
                    error = %e,
                    "dead shard"
                );
                self.evict(&shard.endpoint);
            }
        }
        sent
    }

    pub async fn put(&self, space: SpaceId, secondary: i64, value: f64) -> Result<()> {
        let req = ShardRequest::Put {
            key: space.row(secondary),
            value,
        };
        match self.call(&self.writes, space.shard_key(), req).await? {
            ShardResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// add adds delta to the sum under (space, secondary) and returns the sum
    /// after the update.
    pub async fn add(&self, space: SpaceId, secondary: i64, delta: f64) -> Result<f64> {
        let req = ShardRequest::Add {
            key: space.row(secondary),
            delta,
        };
        match self.call(&self.writes, space.shard_key(), req).await? {
            ShardResponse::Value(sum) => Ok(sum),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, space: SpaceId, secondary: i64) -> Result<Option<f64>> {
        let req = ShardRequest::Get {
            key: space.row(secondary),
        };
        match self.call(&self.reads, space.shard_key(), req).await? {
            ShardResponse::Found(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// sum reads the running sum of space, zero if it was never added to.
    pub async fn sum(&self, space: SpaceId) -> Result<f64> {
        Ok(self.get(space, 0).await?.unwrap_or(0.0))
    }

    pub async fn query(
        &self,
        space: SpaceId,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<Point<f64>>> {
        let req = ShardRequest::QueryRange {
            partition: space.0,
            min,
            max,
            limit,
        };
        match self.call(&self.reads, space.shard_key(), req).await? {
            ShardResponse::Points(points) => Ok(points),
            other => Err(unexpected(other)),
        }
    }

    pub async fn query_from(
        &self,
        space: SpaceId,
        pivot: i64,
        limit: usize,
    ) -> Result<Vec<Point<f64>>> {
        let req = ShardRequest::QueryFrom {
            partition: space.0,
            pivot,
            limit,
        };
        match self.call(&self.reads, space.shard_key(), req).await? {
            ShardResponse::Points(points) => Ok(points),
            other => Err(unexpected(other)),
        }
    }

    /// link records that the row at (space, secondary) follows prev.
    pub async fn link(&self, space: SpaceId, secondary: i64, prev: BackPointer) -> Result<()> {
        let req = ShardRequest::Link {
            key: space.row(secondary),
            prev,
        };
        match self.call(&self.writes, space.shard_key(), req).await? {
            ShardResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// links_from walks the links of space from pivot in the shard's key
    /// order; on a descending shard that is a timeline read backwards.
    pub async fn links_from(
        &self,
        space: SpaceId,
        pivot: i64,
        limit: usize,
    ) -> Result<Vec<Point<BackPointer>>> {
        let req = ShardRequest::LinksFrom {
            partition: space.0,
            pivot,
            limit,
        };
        match self.call(&self.reads, space.shard_key(), req).await? {
            ShardResponse::Links(links) => Ok(links),
            other => Err(unexpected(other)),
        }
    }

    /// stat reports the counters of the shard that owns key.
    pub async fn stat(&self, key: ShardKey) -> Result<Stat> {
        match self.call(&self.reads, key, ShardRequest::Stat).await? {
            ShardResponse::Stat(stat) => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    /// refresh rebuilds the topology from the anchor directory and drops
    /// connections to shards that left. Returns the new shard count.
    pub async fn refresh(&self) -> Result<usize> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| Error::Config("client has no anchor directory".to_owned()))?;
        let members = directory.list(&self.anchor).await?;
        let mut metric = XorMetric::new();
        for member in members {
            let key = member.shard.key;
            match metric.add(member.shard) {
                Ok(_) => {}
                Err(Error::DuplicateShard(_)) => {
                    tracing::warn!(
                        shard = %key,
                        worker = %member.worker_id,
                        "duplicate shard key ignored"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let live: HashSet<Endpoint> = metric.iter().map(|s| s.endpoint.clone()).collect();
        let size = metric.len();
        let generation = self.topology.replace(metric);

        let gone: Vec<D::Conn> = {
            let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<Endpoint> = conns
                .keys()
                .filter(|e| !live.contains(*e))
                .cloned()
                .collect();
            stale.iter().filter_map(|e| conns.remove(e)).collect()
        };
        for conn in &gone {
            conn.close();
        }
        tracing::info!(shards = size, generation, dropped = gone.len(), "topology refreshed");
        Ok(size)
    }
}

fn unexpected(res: ShardResponse) -> Error {
    Error::Protocol(format!("unexpected response {:?}", res))
}

impl<D: Dialer> Client<D> {
    /// add_batch runs every request, at most `batch` at a time. The result
    /// at index i belongs to the request at index i.
    pub async fn add_batch(self: &Arc<Self>, batch: &[AddRequest]) -> Vec<Result<f64>> {
        self.fan_out(batch.to_vec(), |client, req: AddRequest| async move {
            client.add(req.space, req.secondary, req.delta).await
        })
        .await
    }

    pub async fn sum_batch(self: &Arc<Self>, spaces: &[SpaceId]) -> Vec<Result<f64>> {
        self.fan_out(spaces.to_vec(), |client, space: SpaceId| async move {
            client.sum(space).await
        })
        .await
    }

    async fn fan_out<T, F, Fut>(self: &Arc<Self>, items: Vec<T>, f: F) -> Vec<Result<f64>>
    where
        T: Send + 'static,
        F: Fn(Arc<Self>, T) -> Fut,
        Fut: Future<Output = Result<f64>> + Send + 'static,
    {
        let results: Arc<Mutex<Vec<Option<Result<f64>>>>> =
            Arc::new(Mutex::new((0..items.len()).map(|_| None).collect()));
        let blmtr = Limiter::new(self.batch_limit);
        for (i, item) in items.into_iter().enumerate() {
            let fut = f(self.clone(), item);
            let results_ = results.clone();
            let spawned = blmtr
                .go(async move {
                    let res = fut.await;
                    results_.lock().unwrap_or_else(PoisonError::into_inner)[i] = Some(res);
                })
                .await;
            if let Err(e) = spawned {
                results.lock().unwrap_or_else(PoisonError::into_inner)[i] = Some(Err(e));
            }
        }
        blmtr.wait().await;
        let results =
            std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        results
            .into_iter()
            .enumerate()
            .map(|(i, res)| {
                res.unwrap_or_else(|| {
                    Err(Error::Protocol(format!("batch item {} did not complete", i)))
                })
            })
            .collect()
    }

    /// watch refreshes the topology every time the anchor directory changes.
    /// The task ends when the client is dropped or the directory goes away.
    pub fn watch(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| Error::Config("client has no anchor directory".to_owned()))?;
        let mut rev = directory.watch(&self.anchor)?;
        let client = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while rev.changed().await.is_ok() {
                let client = match client.upgrade() {
                    Some(client) => client,
                    None => return,
                };
                if let Err(e) = client.refresh().await {
                    tracing::warn!(error = %e, "topology refresh failed");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{MemDirectory, Member};
    use crate::request::LocalNetwork;
    use crate::server::ShardServer;
    use crate::storage::InMemEngine;
    use crate::util::test::run_in_tokio;
    use std::time::Duration;

    const LOW: u64 = 0;
    const HIGH: u64 = 0x8000_0000_0000_0000;

    type Server = ShardServer<InMemEngine>;

    fn boot(net: &LocalNetwork, key: u64, port: u16) -> (Shard, Arc<Server>) {
        let server = Server::mount(Default::default(), || Ok(InMemEngine::new())).unwrap();
        let server = Arc::new(server);
        let shard = Shard::new(ShardKey(key), Endpoint::new("127.0.0.1", port));
        net.attach(shard.endpoint.clone(), server.clone());
        (shard, server)
    }

    struct Fixture {
        net: Arc<LocalNetwork>,
        shards: Vec<Shard>,
        servers: Vec<Arc<Server>>,
        client: Arc<Client<Arc<LocalNetwork>>>,
    }

    fn two_shards() -> Fixture {
        let net = Arc::new(LocalNetwork::new());
        let (low, low_server) = boot(&net, LOW, 7000);
        let (high, high_server) = boot(&net, HIGH, 7001);
        let shards = vec![low, high];
        let client = Arc::new(Client::with_shards(shards.clone(), net.clone()).unwrap());
        Fixture {
            net,
            shards,
            servers: vec![low_server, high_server],
            client,
        }
    }

    #[test]
    fn test_space_id() {
        let a = SpaceId::hash("cpu", vec![("host", "a"), ("dc", "x")]);
        let b = SpaceId::hash(" cpu", vec![("dc ", "x"), ("host", " a ")]);
        assert_eq!(a, b);
        assert_ne!(a, SpaceId::hash("mem", vec![("host", "a"), ("dc", "x")]));
        assert_ne!(a, SpaceId::hash("cpu", vec![("host", "b"), ("dc", "x")]));
        let none: Vec<(&str, &str)> = Vec::new();
        assert_eq!(SpaceId::hash("cpu", none.clone()), SpaceId::hash("cpu", none));
        assert_eq!(SpaceId::from_bytes(b"k"), SpaceId::from_bytes(b"k"));
        assert_eq!(SpaceId(0x1000).shard_key(), ShardKey(0x1000));
    }

    #[test]
    fn test_routing() {
        run_in_tokio(async {
            let f = two_shards();
            let low_space = SpaceId(0x1000);
            let high_space = SpaceId(HIGH | 0x1000);
            assert_eq!(f.client.locate(low_space).unwrap().key, ShardKey(LOW));

            f.client.put(low_space, 5, 42.0).await.unwrap();
            assert_eq!(f.client.get(low_space, 5).await.unwrap(), Some(42.0));
            assert_eq!(f.servers[0].get::<f64>(low_space.row(5)).await.unwrap(), Some(42.0));
            assert_eq!(f.servers[1].get::<f64>(low_space.row(5)).await.unwrap(), None);

            assert_eq!(f.client.add(high_space, 0, 2.0).await.unwrap(), 2.0);
            assert_eq!(f.client.add(high_space, 0, 0.5).await.unwrap(), 2.5);
            assert_eq!(f.client.sum(high_space).await.unwrap(), 2.5);
            assert_eq!(f.client.sum(low_space).await.unwrap(), 0.0);

            for t in 10..20 {
                f.client.put(high_space, t, t as f64).await.unwrap();
            }
            let points = f.client.query(high_space, 12, 15, 100).await.unwrap();
            let ts: Vec<i64> = points.iter().map(|p| p.secondary).collect();
            assert_eq!(ts, vec![12, 13, 14]);
            let points = f.client.query_from(high_space, 18, 100).await.unwrap();
            assert_eq!(points.len(), 2);

            let stat = f.client.stat(ShardKey(HIGH)).await.unwrap();
            assert_eq!(stat.writes, 12);

            let timeline = SpaceId(0x2000);
            f.client.link(timeline, 4, BackPointer(0)).await.unwrap();
            f.client.link(timeline, 9, BackPointer(4)).await.unwrap();
            let links = f.client.links_from(timeline, 0, 10).await.unwrap();
            let chain: Vec<(i64, BackPointer)> =
                links.iter().map(|p| (p.secondary, p.value)).collect();
            assert_eq!(chain, vec![(4, BackPointer(0)), (9, BackPointer(4))]);
            assert_eq!(f.servers[1].stat().await.unwrap().writes, 12);
        });
    }

    #[test]
    fn test_no_shard() {
        run_in_tokio(async {
            let net = Arc::new(LocalNetwork::new());
            let client = Client::with_shards(Vec::new(), net).unwrap();
            assert_eq!(
                client.put(SpaceId(1), 0, 1.0).await,
                Err(Error::NoShard(ShardKey(1)))
            );
        });
    }

    #[test]
    fn test_dead_shard() {
        run_in_tokio(async {
            let f = two_shards();
            let low_space = SpaceId(0x1000);
            f.client.put(low_space, 1, 1.0).await.unwrap();
            f.net.disconnect(&f.shards[0].endpoint);

            let err = f.client.put(low_space, 2, 2.0).await.unwrap_err();
            assert!(err.is_unreachable());
            // re-dialing fails as well, and nothing lands elsewhere
            assert!(f.client.add(low_space, 0, 1.0).await.unwrap_err().is_unreachable());
            let high = &f.servers[1];
            assert!(high.query_from::<f64>(low_space.0, i64::MIN, 10).await.unwrap().is_empty());
            assert_eq!(high.stat().await.unwrap().writes, 0);

            // the live shard keeps serving
            f.client.put(SpaceId(HIGH), 0, 3.0).await.unwrap();
        });
    }

    #[test]
    fn test_batches() {
        run_in_tokio(async {
            let f = two_shards();
            f.net.disconnect(&f.shards[1].endpoint);
            let low = SpaceId(0x1000);
            let high = SpaceId(HIGH | 0x1000);
            let batch = vec![
                AddRequest { space: low, secondary: 0, delta: 1.0 },
                AddRequest { space: high, secondary: 0, delta: 1.0 },
                AddRequest { space: low, secondary: 0, delta: 2.0 },
            ];
            let results = f.client.add_batch(&batch).await;
            assert_eq!(results.len(), 3);
            assert!(results[0].is_ok());
            assert!(results[1].as_ref().unwrap_err().is_unreachable());
            assert!(results[2].is_ok());

            let many: Vec<AddRequest> = (0..50)
                .map(|i| AddRequest { space: SpaceId(i), secondary: 0, delta: i as f64 })
                .collect();
            let results = f.client.add_batch(&many).await;
            for (i, res) in results.into_iter().enumerate() {
                assert_eq!(res.unwrap(), i as f64);
            }

            let sums = f.client.sum_batch(&[low, high, SpaceId(3)]).await;
            assert_eq!(sums[0], Ok(3.0));
            assert!(sums[1].is_err());
            assert_eq!(sums[2], Ok(3.0));
            assert!(f.client.sum_batch(&[]).await.is_empty());
        });
    }

    fn member(shard: &Shard) -> Member {
        Member {
            worker_id: format!("worker-{}", shard.key),
            shard: shard.clone(),
        }
    }

    #[test]
    fn test_refresh() {
        run_in_tokio(async {
            let net = Arc::new(LocalNetwork::new());
            let (low, _) = boot(&net, LOW, 7000);
            let (high, high_server) = boot(&net, HIGH, 7001);
            let config = ClusterConfig::from_json(r#"{ "shards": [] }"#).unwrap();
            let directory = Arc::new(MemDirectory::new());
            directory.register(&config.anchor, member(&low)).await.unwrap();

            let client = Client::new(&config, net.clone(), directory.clone()).await.unwrap();
            assert_eq!(client.topology().len(), 1);
            let high_space = SpaceId(HIGH | 0x1000);
            assert_eq!(client.locate(high_space).unwrap().key, ShardKey(LOW));

            directory.register(&config.anchor, member(&high)).await.unwrap();
            assert_eq!(client.refresh().await.unwrap(), 2);
            assert_eq!(client.locate(high_space).unwrap().key, ShardKey(HIGH));
            client.put(high_space, 0, 1.0).await.unwrap();
            assert_eq!(high_server.get::<f64>(high_space.row(0)).await.unwrap(), Some(1.0));

            directory.unregister(&config.anchor, &member(&low).worker_id).await.unwrap();
            assert_eq!(client.refresh().await.unwrap(), 1);
            assert_eq!(client.locate(SpaceId(0)).unwrap().key, ShardKey(HIGH));
            assert!(client.topology().generation() >= 3);

            let fixed = Client::with_shards(vec![low], net).unwrap();
            assert!(matches!(fixed.refresh().await, Err(Error::Config(_))));
        });
    }

    #[test]
    fn test_watch() {
        run_in_tokio(async {
            let net = Arc::new(LocalNetwork::new());
            let (low, _) = boot(&net, LOW, 7000);
            let (high, _) = boot(&net, HIGH, 7001);
            let config = ClusterConfig::from_json(r#"{ "shards": [] }"#).unwrap();
            let directory = Arc::new(MemDirectory::new());
            directory.register(&config.anchor, member(&low)).await.unwrap();
            let client = Arc::new(Client::new(&config, net, directory.clone()).await.unwrap());
            let watcher = client.watch().unwrap();

            directory.register(&config.anchor, member(&high)).await.unwrap();
            let grown = tokio::time::timeout(Duration::from_secs(2), async {
                while client.topology().len() < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            assert!(grown.is_ok());
            watcher.abort();
        });
    }
}
