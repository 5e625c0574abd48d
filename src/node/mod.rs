use crate::request::{Request, Response};
use crate::util::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Node is anything that answers requests: a shard server, or a test double.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    type Req: Request;
    type Res: Response;

    async fn process(&self, req: Self::Req) -> Result<Self::Res>;
}

#[async_trait]
impl<N: Node> Node for Arc<N> {
    type Req = N::Req;
    type Res = N::Res;

    async fn process(&self, req: Self::Req) -> Result<Self::Res> {
        (**self).process(req).await
    }
}
