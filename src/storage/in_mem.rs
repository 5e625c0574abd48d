use crate::storage::{Cursor, Engine, EngineIter, Table, WriteOptions};
use crate::util::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// InMemEngine keeps rows in an ordered map. Nothing survives a restart.
#[derive(Default)]
pub struct InMemEngine {
    inner: RwLock<Table>,
    closed: AtomicBool,
}

impl InMemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Storage("engine closed".to_owned()));
        }
        Ok(())
    }
}

impl Engine for InMemEngine {
    fn put(&self, _opts: WriteOptions, k: &[u8], v: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev_v) = inner.get_mut(k) {
            prev_v.clear();
            prev_v.extend_from_slice(v);
        } else {
            inner.insert(k.to_vec(), v.to_vec());
        }
        Ok(())
    }

    fn del(&self, _opts: WriteOptions, k: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remove(k);
        Ok(())
    }

    fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.get(k).cloned())
    }

    fn seek(&self, from: &[u8]) -> Result<EngineIter<'_>> {
        self.check_open()?;
        Ok(Cursor::seek(&self.inner, from))
    }

    fn sync(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
