use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A point in the 64-bit XOR space. Shards sit at their pivot's key and own
/// every key that is closer to them than to any other shard.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShardKey(pub u64);

pub const KEY_BITS: usize = 64;

impl ShardKey {
    /// bit returns the r-th most significant bit, r in 0..64.
    #[inline]
    pub fn bit(self, r: usize) -> usize {
        if r >= KEY_BITS {
            return 0;
        }
        ((self.0 >> (KEY_BITS - 1 - r)) & 1) as usize
    }

    #[inline]
    pub fn distance(self, other: ShardKey) -> u64 {
        self.0 ^ other.0
    }

    /// Number of leading bits shared with other.
    #[inline]
    pub fn common_prefix(self, other: ShardKey) -> usize {
        (self.0 ^ other.0).leading_zeros() as usize
    }

    /// Parses the `0x`-prefixed hexadecimal form used in cluster configs.
    pub fn parse_hex(s: &str) -> Result<ShardKey> {
        let digits = s
            .trim()
            .strip_prefix("0x")
            .ok_or_else(|| Error::Config(format!("invalid pivot format {:?}", s)))?;
        u64::from_str_radix(digits, 16)
            .map(ShardKey)
            .map_err(|e| Error::Config(format!("invalid pivot {:?}: {}", s, e)))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Network address of a shard worker, `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Endpoint {
        Endpoint(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Endpoint {
        Endpoint(s.to_owned())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shard describes one partition owner. It is never mutated: a topology
/// change replaces the whole set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub key: ShardKey,
    pub endpoint: Endpoint,
    /// Auxiliary (HTTP) port of the worker, if it exposes one.
    pub aux_port: Option<u16>,
}

impl Shard {
    pub fn new(key: ShardKey, endpoint: Endpoint) -> Shard {
        Shard {
            key,
            endpoint,
            aux_port: None,
        }
    }
}

/// Item is anything that has a position in the XOR space.
pub trait Item {
    fn key(&self) -> ShardKey;
}

impl Item for ShardKey {
    fn key(&self) -> ShardKey {
        *self
    }
}

impl Item for Shard {
    fn key(&self) -> ShardKey {
        self.key
    }
}

impl<T: Item> Item for Arc<T> {
    fn key(&self) -> ShardKey {
        self.as_ref().key()
    }
}

/// Ring maps an arbitrary key to the item that owns it.
pub trait Ring {
    type Item: Item;

    /// find returns the owner of key, or None when the ring is empty.
    fn find(&self, key: ShardKey) -> Option<&Self::Item>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

mod topology;
mod xor;
pub use topology::Topology;
pub use xor::XorMetric;
