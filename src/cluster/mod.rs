use crate::anchor::{Directory, MemDirectory, Member};
use crate::client::Client;
use crate::config::{ClusterConfig, ShardConfig};
use crate::limiter::Limiter;
use crate::request::LocalNetwork;
use crate::server::{ShardServer, ShardServerOptions};
use crate::shard::{Shard, ShardKey, XorMetric};
use crate::storage::{Engine, InMemEngine, LogEngine};
use crate::util::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shards booted at once.
const BOOT_CONCURRENCY: usize = 20;
/// Candidates drawn per key handed out to a shard without a pivot.
const KEY_CANDIDATES: usize = 5;

pub type LocalServer = ShardServer<Box<dyn Engine>>;

pub struct Worker {
    pub id: String,
    pub shard: Shard,
    pub server: Arc<LocalServer>,
    forget: Option<JoinHandle<()>>,
}

/// LocalCluster runs every shard of a configuration inside this process,
/// registered in an in-memory anchor directory and reachable over a
/// `LocalNetwork`.
pub struct LocalCluster {
    config: ClusterConfig,
    network: Arc<LocalNetwork>,
    directory: Arc<MemDirectory>,
    workers: Vec<Worker>,
}

/// Picks a key for every shard: its pivot if configured, otherwise a key in
/// the sparsest region of the space taken so far.
fn assign_keys(config: &ClusterConfig) -> Result<Vec<ShardKey>> {
    let mut taken = XorMetric::new();
    let pivots = config
        .shards
        .iter()
        .map(ShardConfig::pivot)
        .collect::<Result<Vec<_>>>()?;
    for key in pivots.iter().flatten() {
        taken.add(*key)?;
    }
    let mut rng = rand::thread_rng();
    let mut keys = Vec::with_capacity(pivots.len());
    for pivot in pivots {
        let key = match pivot {
            Some(key) => key,
            None => loop {
                let key = taken.choose_min_k(KEY_CANDIDATES, &mut rng);
                if taken.add(key).is_ok() {
                    break key;
                }
            },
        };
        keys.push(key);
    }
    Ok(keys)
}

fn boot_worker(options: ShardServerOptions, config: &ShardConfig, key: ShardKey) -> Result<Worker> {
    let server: LocalServer = match &config.disk_path {
        Some(path) => ShardServer::mount(options, || {
            Ok(Box::new(LogEngine::open(path)?) as Box<dyn Engine>)
        })?,
        None => ShardServer::mount(options, || {
            Ok(Box::new(InMemEngine::new()) as Box<dyn Engine>)
        })?,
    };
    let server = Arc::new(server);
    let forget = config
        .forget_secs
        .map(|secs| server.spawn_forget_loop(Duration::from_secs(secs)));
    let shard = config.shard(key);
    Ok(Worker {
        id: format!("worker-{}", shard.endpoint),
        shard,
        server,
        forget,
    })
}

impl LocalCluster {
    /// boot starts the shards of config. A shard that fails to mount is
    /// logged and left out; the rest of the cluster still comes up.
    pub async fn boot(config: ClusterConfig) -> Result<Self> {
        let keys = assign_keys(&config)?;
        let options = config.server_options();
        let lmtr = Limiter::new(BOOT_CONCURRENCY);
        let mut booting = Vec::with_capacity(keys.len());
        for (sh, key) in config.shards.iter().cloned().zip(keys) {
            let options = options.clone();
            let handle = lmtr
                .go(async move {
                    let booted = boot_worker(options, &sh, key);
                    if let Err(e) = &booted {
                        tracing::error!(
                            host = %sh.host,
                            port = sh.port,
                            error = %e,
                            "shard boot failed"
                        );
                    }
                    booted
                })
                .await?;
            booting.push(handle);
        }
        lmtr.wait().await;

        let network = Arc::new(LocalNetwork::new());
        let directory = Arc::new(MemDirectory::new());
        let mut workers = Vec::with_capacity(booting.len());
        for handle in booting {
            let worker = match handle.await {
                Ok(Ok(worker)) => worker,
                Ok(Err(_)) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "shard boot task failed");
                    continue;
                }
            };
            network.attach(worker.shard.endpoint.clone(), worker.server.clone());
            let member = Member {
                worker_id: worker.id.clone(),
                shard: worker.shard.clone(),
            };
            directory.register(&config.anchor, member).await?;
            tracing::info!(worker = %worker.id, shard = %worker.shard.key, "shard up");
            workers.push(worker);
        }
        tracing::info!(booted = workers.len(), configured = config.shards.len(), "cluster up");
        Ok(LocalCluster {
            config,
            network,
            directory,
            workers,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn directory(&self) -> &Arc<MemDirectory> {
        &self.directory
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, key: ShardKey) -> Option<&Worker> {
        self.workers.iter().find(|w| w.shard.key == key)
    }

    /// client returns a client routing through this cluster's directory.
    pub async fn client(&self) -> Result<Client<Arc<LocalNetwork>>> {
        Client::new(&self.config, self.network.clone(), self.directory.clone()).await
    }

    /// kill cuts the worker owning key off the network while it stays
    /// registered, as a crashed worker would.
    pub fn kill(&self, key: ShardKey) -> bool {
        match self.worker(key) {
            Some(worker) => self.network.disconnect(&worker.shard.endpoint),
            None => false,
        }
    }

    /// stop takes the worker owning key out of the directory and shuts it down.
    pub async fn stop(&mut self, key: ShardKey) -> Result<bool> {
        let at = match self.workers.iter().position(|w| w.shard.key == key) {
            Some(at) => at,
            None => return Ok(false),
        };
        let worker = self.workers.remove(at);
        self.retire(worker).await?;
        Ok(true)
    }

    async fn retire(&self, worker: Worker) -> Result<()> {
        self.directory
            .unregister(&self.config.anchor, &worker.id)
            .await?;
        self.network.disconnect(&worker.shard.endpoint);
        if let Some(forget) = worker.forget {
            forget.abort();
        }
        worker.server.shutdown().await
    }

    pub async fn shutdown(mut self) -> Result<()> {
        let mut first_err = None;
        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = self.retire(worker).await {
                tracing::error!(error = %e, "shard shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        tracing::info!("cluster down");
        first_err.map_or(Ok(()), Err)
    }
}
