use crate::node::Node;
use crate::server::{ShardRequest, ShardResponse};
use crate::shard::Endpoint;
use crate::util::Result;
use async_trait::async_trait;

pub trait Request: Send + 'static {}
pub trait Response: Send + 'static {}

impl<T: Send + 'static> Request for T {}
impl<T: Send + 'static> Response for T {}

/// Sender is the calling end of a connection to a node.
#[async_trait]
pub trait Sender: Send + Sync {
    type Req: Request;
    type Res: Response;

    /// send delivers req and waits for the answer. Transport failures come
    /// back as `Error::ShardUnreachable` or `Error::Timeout`.
    async fn send(&self, req: Self::Req) -> Result<Self::Res>;
    fn close(&self);
}

#[async_trait]
pub trait Receiver {
    type N: Node;

    // polling requests and send the response when it's ready.
    async fn collect_req(mut self);
}

/// Dialer resolves an endpoint into a connection to the shard served there.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Sender<Req = ShardRequest, Res = ShardResponse> + Clone + 'static;

    async fn dial(&self, endpoint: &Endpoint) -> Result<Self::Conn>;
}

#[async_trait]
impl<D: Dialer> Dialer for std::sync::Arc<D> {
    type Conn = D::Conn;

    async fn dial(&self, endpoint: &Endpoint) -> Result<Self::Conn> {
        (**self).dial(endpoint).await
    }
}

pub mod channel;
mod local;
pub use local::LocalNetwork;
