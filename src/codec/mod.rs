use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryInto;

mod row;
pub use row::{Point, RowKey, ROW_KEY_LEN};

/// KeyOrder is the direction in which a store iterates the secondary keys of
/// a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrder {
    /// Oldest first; suited to time windows.
    Ascending,
    /// Newest first; suited to "the latest N before X" timelines.
    Descending,
}

impl Default for KeyOrder {
    fn default() -> Self {
        KeyOrder::Ascending
    }
}

pub const ROW_VALUE_LEN: usize = 8;

/// RowValue is a fixed-width scalar payload stored under a row key.
pub trait RowValue: Sized + Send + 'static {
    fn encode(&self) -> [u8; ROW_VALUE_LEN];
    fn decode(raw: &[u8]) -> Result<Self>;
}

fn value_bytes(raw: &[u8]) -> Result<[u8; ROW_VALUE_LEN]> {
    raw.try_into().map_err(|_| {
        Error::Codec(format!(
            "row value is {} bytes, want {}",
            raw.len(),
            ROW_VALUE_LEN
        ))
    })
}

/// Measurements and running sums.
impl RowValue for f64 {
    fn encode(&self) -> [u8; ROW_VALUE_LEN] {
        self.to_bits().to_be_bytes()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        Ok(f64::from_bits(u64::from_be_bytes(value_bytes(raw)?)))
    }
}

/// BackPointer links a row to the previous row of the same partition, with 0
/// meaning "nothing before this one".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackPointer(pub i64);

impl RowValue for BackPointer {
    fn encode(&self) -> [u8; ROW_VALUE_LEN] {
        self.0.to_be_bytes()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        Ok(BackPointer(i64::from_be_bytes(value_bytes(raw)?)))
    }
}
