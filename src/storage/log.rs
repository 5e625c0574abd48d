//! A log-structured engine: every mutation is appended to a single
//! checksummed log file and applied to an ordered in-memory index. Opening
//! the engine replays the log; a torn or corrupt tail is cut off, since it can
//! only be the remains of a write that never completed.
//!
//! Overwrites and deletes leave dead records behind; once the log holds
//! `COMPACT_RATIO` times more records than live rows it is rewritten in place.
//!
//! Record layout, all integers little-endian:
//!
//! ```text
//! [len: u32][op: u8][klen: u32][key][value][crc32(payload): u32]
//!           \______________ payload (len bytes) ______/
//! ```

use crate::storage::{Cursor, Engine, EngineIter, Table, WriteOptions};
use crate::util::{Error, Result};
use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

const LOG_NAME: &str = "store.log";
const SHADOW_NAME: &str = "store.log.shadow";

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;

// Bound on a single record, also rejects garbage lengths during replay.
const MAX_RECORD: usize = 64 << 20;

// Logs shorter than this are never compacted on the write path.
const COMPACT_MIN_RECORDS: u64 = 4096;
const COMPACT_RATIO: u64 = 4;

pub struct LogEngine {
    dir: PathBuf,
    // None once closed
    log: Mutex<Option<LogFile>>,
    index: RwLock<Table>,
}

struct LogFile {
    file: File,
    offset: u64,
    // records in the file, live or not
    records: u64,
}

enum Op<'a> {
    Put(&'a [u8], &'a [u8]),
    Del(&'a [u8]),
}

impl LogEngine {
    /// open mounts the engine stored in dir, creating it if needed.
    /// Any failure here is a mount failure.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        Self::mount(&dir).map_err(|e| Error::Mount(format!("{}: {}", dir.display(), e)))
    }

    fn mount(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        // A leftover shadow is a compaction that never got promoted.
        let shadow = dir.join(SHADOW_NAME);
        if shadow.exists() {
            fs::remove_file(&shadow)?;
        }
        let path = dir.join(LOG_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut index = Table::new();
        let (valid, records) = replay(&raw, &mut index);
        if valid < raw.len() {
            tracing::warn!(
                path = %path.display(),
                discarded = raw.len() - valid,
                "truncating torn log tail"
            );
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid as u64))?;
        tracing::info!(path = %path.display(), rows = index.len(), "log engine mounted");

        Ok(LogEngine {
            dir: dir.to_path_buf(),
            log: Mutex::new(Some(LogFile {
                file,
                offset: valid as u64,
                records,
            })),
            index: RwLock::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Size of the log file in bytes.
    pub fn log_size(&self) -> u64 {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |log| log.offset)
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, opts: WriteOptions, op: Op<'_>) -> Result<()> {
        let record = encode_record(&op)?;
        let mut guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let log = guard
            .as_mut()
            .ok_or_else(|| Error::Storage("engine closed".to_owned()))?;
        if let Err(e) = log.file.write_all(&record) {
            // Drop whatever part of the record made it to the file.
            let _ = log.file.set_len(log.offset);
            let _ = log.file.seek(SeekFrom::Start(log.offset));
            return Err(e.into());
        }
        log.offset += record.len() as u64;
        log.records += 1;
        if opts.sync {
            log.file.sync_data()?;
        }
        // Apply while still holding the log lock so the index follows log order.
        let live = {
            let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
            match op {
                Op::Put(k, v) => {
                    index.insert(k.to_vec(), v.to_vec());
                }
                Op::Del(k) => {
                    index.remove(k);
                }
            }
            index.len() as u64
        };
        if log.records > COMPACT_MIN_RECORDS && log.records > COMPACT_RATIO * live {
            // The write itself is durable already; a failed rewrite only
            // leaves the log long.
            if let Err(e) = self.rewrite(log) {
                tracing::warn!(dir = %self.dir.display(), error = %e, "log compaction failed");
            }
        }
        Ok(())
    }

    /// rewrite copies one record per live row into a shadow file, syncs it
    /// and renames it over the log. The shadow's handle is kept as the new
    /// log, so if anything fails before the rename the old log stays in use.
    fn rewrite(&self, log: &mut LogFile) -> Result<()> {
        let shadow_path = self.dir.join(SHADOW_NAME);
        let mut shadow = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&shadow_path)?;
        let (mut offset, mut records) = (0u64, 0u64);
        {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            for (k, v) in index.iter() {
                let record = encode_record(&Op::Put(k, v))?;
                shadow.write_all(&record)?;
                offset += record.len() as u64;
                records += 1;
            }
        }
        shadow.sync_all()?;
        if let Err(e) = fs::rename(&shadow_path, self.dir.join(LOG_NAME)) {
            let _ = fs::remove_file(&shadow_path);
            return Err(e.into());
        }
        let before = log.offset;
        *log = LogFile {
            file: shadow,
            offset,
            records,
        };
        tracing::debug!(before, after = offset, "log compacted");
        Ok(())
    }
}

impl Engine for LogEngine {
    fn put(&self, opts: WriteOptions, k: &[u8], v: &[u8]) -> Result<()> {
        self.append(opts, Op::Put(k, v))
    }

    fn del(&self, opts: WriteOptions, k: &[u8]) -> Result<()> {
        self.append(opts, Op::Del(k))
    }

    fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.get(k).cloned())
    }

    fn seek(&self, from: &[u8]) -> Result<EngineIter<'_>> {
        self.check_open()?;
        Ok(Cursor::seek(&self.index, from))
    }

    fn sync(&self) -> Result<()> {
        let guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(log) => Ok(log.file.sync_data()?),
            None => Err(Error::Storage("engine closed".to_owned())),
        }
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = guard.take() {
            log.file.sync_all()?;
            tracing::info!(dir = %self.dir.display(), "log engine closed");
        }
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        let mut guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let log = guard
            .as_mut()
            .ok_or_else(|| Error::Storage("engine closed".to_owned()))?;
        self.rewrite(log)
    }
}

impl LogEngine {
    fn check_open(&self) -> Result<()> {
        let guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return Err(Error::Storage("engine closed".to_owned()));
        }
        Ok(())
    }
}

fn encode_record(op: &Op<'_>) -> Result<Vec<u8>> {
    let (code, k, v): (u8, &[u8], &[u8]) = match op {
        Op::Put(k, v) => (OP_PUT, k, v),
        Op::Del(k) => (OP_DEL, k, &[]),
    };
    let len = 1 + 4 + k.len() + v.len();
    if len > MAX_RECORD {
        return Err(Error::Storage(format!("record of {} bytes too big", len)));
    }
    let mut record = Vec::with_capacity(4 + len + 4);
    record.extend_from_slice(&(len as u32).to_le_bytes());
    record.push(code);
    record.extend_from_slice(&(k.len() as u32).to_le_bytes());
    record.extend_from_slice(k);
    record.extend_from_slice(v);
    let crc = crc32fast::hash(&record[4..]);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

fn read_u32(raw: &[u8], at: usize) -> Option<u32> {
    let bytes = raw.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn decode_payload(payload: &[u8]) -> Option<Op<'_>> {
    let (&code, rest) = payload.split_first()?;
    let klen = read_u32(rest, 0)? as usize;
    let body = rest.get(4..)?;
    if klen > body.len() {
        return None;
    }
    let (k, v) = body.split_at(klen);
    match code {
        OP_PUT => Some(Op::Put(k, v)),
        OP_DEL if v.is_empty() => Some(Op::Del(k)),
        _ => None,
    }
}

/// replay applies every intact record of raw to index and returns the length
/// of the intact prefix along with the number of records in it.
fn replay(raw: &[u8], index: &mut Table) -> (usize, u64) {
    let mut offset = 0;
    let mut records = 0;
    loop {
        let len = match read_u32(raw, offset) {
            Some(len) if (len as usize) <= MAX_RECORD => len as usize,
            _ => return (offset, records),
        };
        let start = offset + 4;
        let end = start + len;
        let (payload, crc) = match (raw.get(start..end), read_u32(raw, end)) {
            (Some(payload), Some(crc)) => (payload, crc),
            _ => return (offset, records),
        };
        if crc32fast::hash(payload) != crc {
            return (offset, records);
        }
        match decode_payload(payload) {
            Some(Op::Put(k, v)) => {
                index.insert(k.to_vec(), v.to_vec());
            }
            Some(Op::Del(k)) => {
                index.remove(k);
            }
            None => return (offset, records),
        }
        records += 1;
        offset = end + 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempdir().unwrap();
        {
            let engine = LogEngine::open(dir.path()).unwrap();
            engine.put(WriteOptions::SYNC, b"a", b"1").unwrap();
            engine.put(WriteOptions::NO_SYNC, b"b", b"2").unwrap();
            engine.put(WriteOptions::NO_SYNC, b"a", b"3").unwrap();
            engine.del(WriteOptions::NO_SYNC, b"b").unwrap();
            engine.put(WriteOptions::NO_SYNC, b"c", b"").unwrap();
            engine.close().unwrap();
            assert!(engine.get(b"a").is_err());
        }
        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert_eq!(engine.get(b"c").unwrap(), Some(Vec::new()));
        let keys: Vec<Vec<u8>> = engine.seek(b"").unwrap().map(|kv| kv.unwrap().0).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let intact;
        {
            let engine = LogEngine::open(dir.path()).unwrap();
            engine.put(WriteOptions::SYNC, b"k1", b"v1").unwrap();
            engine.put(WriteOptions::SYNC, b"k2", b"v2").unwrap();
            intact = engine.log_size();
            engine.close().unwrap();
        }
        // half a record, as left behind by a crash mid-write
        let partial = encode_record(&Op::Put(b"k3", b"v3")).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_NAME))
            .unwrap();
        file.write_all(&partial[..partial.len() - 3]).unwrap();
        drop(file);

        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.log_size(), intact);
        assert_eq!(engine.get(b"k3").unwrap(), None);
        // appends continue after the cut
        engine.put(WriteOptions::SYNC, b"k3", b"v3").unwrap();
        engine.close().unwrap();
        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.get(b"k3").unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = tempdir().unwrap();
        {
            let engine = LogEngine::open(dir.path()).unwrap();
            engine.put(WriteOptions::SYNC, b"k1", b"v1").unwrap();
            engine.put(WriteOptions::SYNC, b"k2", b"v2").unwrap();
            engine.close().unwrap();
        }
        let path = dir.path().join(LOG_NAME);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 5;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(engine.get(b"k2").unwrap(), None);
    }

    #[test]
    fn test_compact_keeps_live_rows() {
        let dir = tempdir().unwrap();
        let engine = LogEngine::open(dir.path()).unwrap();
        for i in 0..100u32 {
            engine
                .put(WriteOptions::NO_SYNC, b"hot", &i.to_be_bytes())
                .unwrap();
        }
        engine.put(WriteOptions::NO_SYNC, b"cold", b"x").unwrap();
        let before = engine.log_size();
        engine.compact().unwrap();
        assert!(engine.log_size() < before);
        assert!(!dir.path().join(SHADOW_NAME).exists());
        engine.put(WriteOptions::SYNC, b"new", b"y").unwrap();
        engine.close().unwrap();

        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.len(), 3);
        assert_eq!(engine.get(b"hot").unwrap(), Some(99u32.to_be_bytes().to_vec()));
        assert_eq!(engine.get(b"new").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_overwrites_trigger_compaction() {
        let dir = tempdir().unwrap();
        let engine = LogEngine::open(dir.path()).unwrap();
        let record = encode_record(&Op::Put(b"hot", &0u32.to_be_bytes())).unwrap();
        let record_len = record.len() as u64;
        let rounds = COMPACT_MIN_RECORDS as u32 + 100;
        for i in 0..rounds {
            engine
                .put(WriteOptions::NO_SYNC, b"hot", &i.to_be_bytes())
                .unwrap();
        }
        assert_eq!(engine.len(), 1);
        assert!(engine.log_size() <= 100 * record_len);
        engine.close().unwrap();

        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.get(b"hot").unwrap(), Some((rounds - 1).to_be_bytes().to_vec()));
    }

    #[test]
    fn test_open_failure_is_mount_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        assert!(matches!(
            LogEngine::open(blocker.join("shard")),
            Err(Error::Mount(_))
        ));
    }
}
