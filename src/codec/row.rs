use crate::codec::KeyOrder;
use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryInto;

pub const ROW_KEY_LEN: usize = 16;

const SIGN: u64 = 1 << 63;

/// RowKey addresses one row of a shard-local store.
///
/// Encoded as 16 big-endian bytes, `[partition][secondary']`, so that a
/// partition's rows are contiguous and byte order follows `secondary` in the
/// store's `KeyOrder`:
///
/// - `Ascending`: `secondary' = secondary ^ SIGN`. Offset binary, so
///   negative values sort before zero and positives.
/// - `Descending`: `secondary' = !secondary ^ SIGN`. `!s` is `-s - 1`, the
///   sign flip that reverses iteration order, and it is total over `i64`
///   (no overflow at `i64::MIN`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    // partition must come first: it is the iteration prefix
    pub partition: u64,
    pub secondary: i64,
}

impl RowKey {
    pub fn new(partition: u64, secondary: i64) -> RowKey {
        RowKey {
            partition,
            secondary,
        }
    }

    pub fn encode(&self, order: KeyOrder) -> [u8; ROW_KEY_LEN] {
        let secondary = match order {
            KeyOrder::Ascending => self.secondary as u64 ^ SIGN,
            KeyOrder::Descending => !self.secondary as u64 ^ SIGN,
        };
        let mut raw = [0u8; ROW_KEY_LEN];
        raw[..8].copy_from_slice(&self.partition.to_be_bytes());
        raw[8..].copy_from_slice(&secondary.to_be_bytes());
        raw
    }

    pub fn decode(raw: &[u8], order: KeyOrder) -> Result<RowKey> {
        if raw.len() != ROW_KEY_LEN {
            return Err(Error::Codec(format!(
                "row key is {} bytes, want {}",
                raw.len(),
                ROW_KEY_LEN
            )));
        }
        let (head, tail) = raw.split_at(8);
        let partition = u64::from_be_bytes(head.try_into().map_err(codec_error)?);
        let stored = u64::from_be_bytes(tail.try_into().map_err(codec_error)?) ^ SIGN;
        let secondary = match order {
            KeyOrder::Ascending => stored as i64,
            KeyOrder::Descending => !(stored as i64),
        };
        Ok(RowKey {
            partition,
            secondary,
        })
    }

    /// Encoded prefix shared by every row of partition.
    pub fn partition_prefix(partition: u64) -> [u8; 8] {
        partition.to_be_bytes()
    }
}

fn codec_error(e: std::array::TryFromSliceError) -> Error {
    Error::Codec(e.to_string())
}

/// Point is one row returned by a range query.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point<V> {
    pub secondary: i64,
    pub value: V,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: [KeyOrder; 2] = [KeyOrder::Ascending, KeyOrder::Descending];

    #[test]
    fn test_round_trip() {
        let keys = [
            RowKey::new(0, 0),
            RowKey::new(1, -1),
            RowKey::new(u64::MAX, i64::MIN),
            RowKey::new(0x1000, i64::MAX),
            RowKey::new(42, 1_700_000_000),
        ];
        for &order in &ORDERS {
            for key in &keys {
                let raw = key.encode(order);
                assert_eq!(RowKey::decode(&raw, order).unwrap(), *key);
                assert_eq!(raw[..8], RowKey::partition_prefix(key.partition));
            }
        }
    }

    #[test]
    fn test_order_preserved_across_signs() {
        let pairs = [(-5i64, -1i64), (-1, 0), (0, 1), (-3, 7), (i64::MIN, i64::MAX)];
        for &(lo, hi) in &pairs {
            let a = RowKey::new(9, lo);
            let b = RowKey::new(9, hi);
            assert!(
                a.encode(KeyOrder::Ascending) < b.encode(KeyOrder::Ascending),
                "ascending {} < {}",
                lo,
                hi
            );
            assert!(
                a.encode(KeyOrder::Descending) > b.encode(KeyOrder::Descending),
                "descending {} > {}",
                lo,
                hi
            );
        }
    }

    #[test]
    fn test_partition_dominates() {
        for &order in &ORDERS {
            let low = RowKey::new(1, i64::MAX).encode(order);
            let high = RowKey::new(2, i64::MIN).encode(order);
            assert!(low < high);
        }
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            RowKey::decode(&[0u8; 15], KeyOrder::Ascending),
            Err(Error::Codec(_))
        ));
        assert!(matches!(
            RowKey::decode(&[0u8; 17], KeyOrder::Descending),
            Err(Error::Codec(_))
        ));
    }
}
