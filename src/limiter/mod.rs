//! Bounded concurrency for request handling and batch fan-out.
//!
//! A `Limiter` hands out at most `limit` sessions at a time. A session starts
//! when `open` returns and ends when the `Session` is dropped, so the permit
//! goes back on every exit path including unwinding.

use crate::util::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Limiter {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Arc<Semaphore>,
    limit: usize,
    pending: AtomicUsize,
    idle: Notify,
}

/// Session is one open slot of a `Limiter`.
pub struct Session {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Limiter {
    pub fn new(limit: usize) -> Limiter {
        // A zero limit could never make progress.
        let limit = limit.max(1);
        Limiter {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(limit)),
                limit,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Number of sessions currently open.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// open waits until fewer than `limit` sessions are open and starts a new
    /// one. Fails only once the limiter is closed.
    pub async fn open(&self) -> Result<Session> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::LimiterClosed)?;
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Ok(Session {
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// go opens a session, then runs fut on the runtime inside it.
    pub async fn go<F>(&self, fut: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let session = self.open().await?;
        Ok(tokio::spawn(async move {
            let _session = session;
            fut.await
        }))
    }

    /// wait returns once every open session has been closed.
    pub async fn wait(&self) {
        loop {
            // Register before checking so a close in between is not missed.
            let idle = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// close refuses new sessions. Open sessions are unaffected and callers
    /// blocked in `open` fail with `Error::LimiterClosed`.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::run_in_tokio;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[test]
    fn test_never_exceeds_limit() {
        run_in_tokio(async {
            let limit = 3;
            let lmtr = Limiter::new(limit);
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..limit + 5 {
                let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
                lmtr.go(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
                assert!(lmtr.pending() <= limit);
            }
            lmtr.wait().await;
            assert_eq!(done.load(Ordering::SeqCst), limit + 5);
            assert!(peak.load(Ordering::SeqCst) <= limit);
            assert_eq!(lmtr.pending(), 0);
        });
    }

    #[test]
    fn test_wait_for_open_sessions() {
        run_in_tokio(async {
            let lmtr = Limiter::new(2);
            // nothing open: returns at once
            lmtr.wait().await;

            let session = lmtr.open().await.unwrap();
            let finished = Arc::new(AtomicBool::new(false));
            let waiter = {
                let (lmtr, finished) = (lmtr.clone(), finished.clone());
                tokio::spawn(async move {
                    lmtr.wait().await;
                    finished.store(true, Ordering::SeqCst);
                })
            };
            sleep(Duration::from_millis(20)).await;
            assert!(!finished.load(Ordering::SeqCst));
            drop(session);
            timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert!(finished.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_release_on_panic() {
        run_in_tokio(async {
            let lmtr = Limiter::new(1);
            let handle = lmtr.go(async { panic!("boom") }).await.unwrap();
            assert!(handle.await.is_err());
            lmtr.wait().await;
            assert_eq!(lmtr.pending(), 0);
            let again = timeout(Duration::from_secs(1), lmtr.open()).await;
            assert!(again.unwrap().is_ok());
        });
    }

    #[test]
    fn test_close() {
        run_in_tokio(async {
            let lmtr = Limiter::new(1);
            let session = lmtr.open().await.unwrap();
            let blocked = {
                let lmtr = lmtr.clone();
                tokio::spawn(async move { lmtr.open().await.map(|_| ()) })
            };
            sleep(Duration::from_millis(10)).await;
            lmtr.close();
            assert_eq!(blocked.await.unwrap(), Err(Error::LimiterClosed));
            assert_eq!(lmtr.pending(), 1);
            drop(session);
            lmtr.wait().await;
            assert!(matches!(lmtr.open().await, Err(Error::LimiterClosed)));
        });
    }
}
