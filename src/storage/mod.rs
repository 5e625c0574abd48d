use crate::util::Result;
use std::collections::BTreeMap;
use std::ops::Bound::{self, Excluded, Included, Unbounded};
use std::sync::{PoisonError, RwLock};

mod in_mem;
mod log;
pub use self::log::LogEngine;
pub use in_mem::InMemEngine;

/// Durability requested for a single write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Flush the write to stable storage before returning.
    pub sync: bool,
}

impl WriteOptions {
    pub const SYNC: WriteOptions = WriteOptions { sync: true };
    pub const NO_SYNC: WriteOptions = WriteOptions { sync: false };
}

pub type KvPair = (Vec<u8>, Vec<u8>);

/// Forward iterator over an engine's rows in byte order of the keys.
pub type EngineIter<'a> = Box<dyn Iterator<Item = Result<KvPair>> + Send + 'a>;

/// Engine is an ordered byte-key/byte-value store.
///
/// All methods take `&self`; implementations do their own locking so that a
/// server can share one engine between concurrent requests.
pub trait Engine: Sync + Send + 'static {
    fn put(&self, opts: WriteOptions, k: &[u8], v: &[u8]) -> Result<()>;
    fn del(&self, opts: WriteOptions, k: &[u8]) -> Result<()>;
    // values are returned owned, they usually leave the process
    fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>>;
    /// seek returns an iterator positioned at the first key >= from.
    /// The iterator does not pin a snapshot: rows written behind the cursor
    /// are not seen, rows written ahead of it may be.
    fn seek(&self, from: &[u8]) -> Result<EngineIter<'_>>;
    fn sync(&self) -> Result<()>;
    /// close releases the engine; every later call fails.
    fn close(&self) -> Result<()>;
    /// compact reclaims space held by overwritten and deleted rows.
    fn compact(&self) -> Result<()> {
        Ok(())
    }
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn put(&self, opts: WriteOptions, k: &[u8], v: &[u8]) -> Result<()> {
        (**self).put(opts, k, v)
    }

    fn del(&self, opts: WriteOptions, k: &[u8]) -> Result<()> {
        (**self).del(opts, k)
    }

    fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(k)
    }

    fn seek(&self, from: &[u8]) -> Result<EngineIter<'_>> {
        (**self).seek(from)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn compact(&self) -> Result<()> {
        (**self).compact()
    }
}

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Cursor re-enters the table on every step instead of holding the lock for
/// the lifetime of the iterator.
struct Cursor<'a> {
    table: &'a RwLock<Table>,
    next_from: Option<Vec<u8>>,
    started: bool,
}

impl<'a> Cursor<'a> {
    fn seek(table: &'a RwLock<Table>, from: &[u8]) -> EngineIter<'a> {
        Box::new(Cursor {
            table,
            next_from: Some(from.to_vec()),
            started: false,
        })
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next_from.take()?;
        let lower: Bound<&[u8]> = if self.started {
            Excluded(from.as_slice())
        } else {
            Included(from.as_slice())
        };
        self.started = true;
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let (k, v) = table
            .range::<[u8], _>((lower, Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))?;
        self.next_from = Some(k.clone());
        Some(Ok((k, v)))
    }
}
