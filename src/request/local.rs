use crate::node::Node;
use crate::request::channel::{new_channel_connect, ChannelSender};
use crate::request::Dialer;
use crate::server::{ShardRequest, ShardResponse};
use crate::shard::Endpoint;
use crate::util::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

type ShardSender = ChannelSender<ShardRequest, ShardResponse>;

/// LocalNetwork routes endpoints to shard servers living in this process.
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<Endpoint, ShardSender>>,
    timeout: Option<Duration>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection handed out by dial gives up after timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        LocalNetwork {
            routes: RwLock::default(),
            timeout: Some(timeout),
        }
    }

    /// attach serves node at endpoint, replacing whatever was there.
    pub fn attach<N>(&self, endpoint: Endpoint, node: Arc<N>)
    where
        N: Node<Req = ShardRequest, Res = ShardResponse>,
    {
        let mut tx = new_channel_connect(endpoint.clone(), node);
        if let Some(timeout) = self.timeout {
            tx = tx.with_timeout(timeout);
        }
        let prev = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.clone(), tx);
        if let Some(prev) = prev {
            prev.shutdown_remote();
        }
        tracing::debug!(%endpoint, "endpoint attached");
    }

    /// disconnect takes endpoint off the network. Connections already dialed
    /// to it fail from now on, as they would if the worker died.
    pub fn disconnect(&self, endpoint: &Endpoint) -> bool {
        let removed = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
        match removed {
            Some(tx) => {
                tx.shutdown_remote();
                tracing::debug!(%endpoint, "endpoint disconnected");
                true
            }
            None => false,
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Dialer for LocalNetwork {
    type Conn = ShardSender;

    async fn dial(&self, endpoint: &Endpoint) -> Result<ShardSender> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::unreachable(endpoint, "no route"))
    }
}
