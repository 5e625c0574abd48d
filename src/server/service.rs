use crate::codec::{BackPointer, Point, RowKey};
use crate::node::Node;
use crate::server::{ShardServer, Stat};
use crate::storage::Engine;
use crate::util::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Calls a shard server answers. Values are sums or measurements, except for
/// links, which chain the rows of a timeline together.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShardRequest {
    Put {
        key: RowKey,
        value: f64,
    },
    Add {
        key: RowKey,
        delta: f64,
    },
    Get {
        key: RowKey,
    },
    QueryRange {
        partition: u64,
        min: i64,
        max: i64,
        limit: usize,
    },
    QueryFrom {
        partition: u64,
        pivot: i64,
        limit: usize,
    },
    Link {
        key: RowKey,
        prev: BackPointer,
    },
    LinksFrom {
        partition: u64,
        pivot: i64,
        limit: usize,
    },
    Stat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShardResponse {
    Done,
    Value(f64),
    Found(Option<f64>),
    Points(Vec<Point<f64>>),
    Links(Vec<Point<BackPointer>>),
    Stat(Stat),
}

#[async_trait]
impl<E: Engine> Node for ShardServer<E> {
    type Req = ShardRequest;
    type Res = ShardResponse;

    async fn process(&self, req: ShardRequest) -> Result<ShardResponse> {
        let res = match req {
            ShardRequest::Put { key, value } => {
                self.put(key, value).await?;
                ShardResponse::Done
            }
            ShardRequest::Add { key, delta } => ShardResponse::Value(self.add(key, delta).await?),
            ShardRequest::Get { key } => ShardResponse::Found(self.get(key).await?),
            ShardRequest::QueryRange {
                partition,
                min,
                max,
                limit,
            } => ShardResponse::Points(self.query_range(partition, min, max, limit).await?),
            ShardRequest::QueryFrom {
                partition,
                pivot,
                limit,
            } => ShardResponse::Points(self.query_from(partition, pivot, limit).await?),
            ShardRequest::Link { key, prev } => {
                self.put(key, prev).await?;
                ShardResponse::Done
            }
            ShardRequest::LinksFrom {
                partition,
                pivot,
                limit,
            } => ShardResponse::Links(self.query_from(partition, pivot, limit).await?),
            ShardRequest::Stat => ShardResponse::Stat(self.stat().await?),
        };
        Ok(res)
    }
}
