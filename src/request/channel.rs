use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::node::Node;
use crate::request::{Receiver as myReceiver, Request, Response, Sender as mySender};
use crate::shard::Endpoint;
use crate::util::{Error, Result};

const QUEUE_DEPTH: usize = 1024;

type Envelope<Req, Res> = (Req, oneshot::Sender<Result<Res>>);

/// ChannelSender calls a node running in the same process. Every clone is a
/// separate connection to the same node: closing one leaves the others open.
pub struct ChannelSender<Req: Request, Res: Response> {
    endpoint: Endpoint,
    req_tx: mpsc::Sender<Envelope<Req, Res>>,
    timeout: Option<Duration>,
    closed: AtomicBool,
    stop: Arc<watch::Sender<bool>>,
}

impl<Req: Request, Res: Response> fmt::Debug for ChannelSender<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<Req: Request, Res: Response> Clone for ChannelSender<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            req_tx: self.req_tx.clone(),
            timeout: self.timeout,
            closed: AtomicBool::new(false),
            stop: self.stop.clone(),
        }
    }
}

pub struct ChannelReceiver<N: Node> {
    endpoint: Endpoint,
    req_rx: mpsc::Receiver<Envelope<N::Req, N::Res>>,
    stop_rx: watch::Receiver<bool>,
    node: Arc<N>,
}

/// new_channel_connect starts serving node at endpoint and returns a sender
/// for it. Must be called within a tokio runtime.
pub fn new_channel_connect<N: Node>(
    endpoint: Endpoint,
    node: Arc<N>,
) -> ChannelSender<N::Req, N::Res> {
    let (req_tx, req_rx) = mpsc::channel(QUEUE_DEPTH);
    let (stop, stop_rx) = watch::channel(false);
    let rx = ChannelReceiver {
        endpoint: endpoint.clone(),
        req_rx,
        stop_rx,
        node,
    };
    tokio::spawn(myReceiver::collect_req(rx));
    ChannelSender {
        endpoint,
        req_tx,
        timeout: None,
        closed: AtomicBool::new(false),
        stop: Arc::new(stop),
    }
}

impl<Req: Request, Res: Response> ChannelSender<Req, Res> {
    /// with_timeout bounds every call made through the returned sender.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// shutdown_remote stops the serving end. Requests not yet picked up are
    /// dropped and every connection to the node fails from then on.
    pub fn shutdown_remote(&self) {
        let _ = self.stop.send(true);
    }

    async fn call(&self, req: Req) -> Result<Res> {
        if self.is_closed() {
            return Err(Error::unreachable(&self.endpoint, "connection closed"));
        }
        let (res_tx, res_rx) = oneshot::channel();
        self.req_tx
            .send((req, res_tx))
            .await
            .map_err(|_| Error::unreachable(&self.endpoint, "receiver gone"))?;
        match res_rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::unreachable(&self.endpoint, "request dropped")),
        }
    }
}

#[async_trait]
impl<Req, Res> mySender for ChannelSender<Req, Res>
where
    Req: Request,
    Res: Response,
{
    type Req = Req;
    type Res = Res;

    async fn send(&self, req: Self::Req) -> Result<Res> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.call(req))
                .await
                .map_err(|_| Error::Timeout(self.endpoint.clone()))?,
            None => self.call(req).await,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("remote panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("remote panic: {}", s)
    } else {
        "remote panic".to_owned()
    }
}

#[async_trait]
impl<N: Node> myReceiver for ChannelReceiver<N> {
    type N = N;

    async fn collect_req(mut self) {
        loop {
            let (req, res_tx) = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                next = self.req_rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let node = self.node.clone();
            let endpoint = self.endpoint.clone();
            tokio::spawn(async move {
                let res = AssertUnwindSafe(node.process(req))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let reason = panic_reason(panic);
                        tracing::error!(%endpoint, %reason, "request handler panicked");
                        Err(Error::unreachable(&endpoint, reason))
                    });
                // the caller may have timed out
                let _ = res_tx.send(res);
            });
        }
        tracing::debug!(endpoint = %self.endpoint, "channel receiver stopped");
    }
}
