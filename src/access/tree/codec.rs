use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt::Debug;

use super::item::ITEM_HEADER_SIZE;

/// Fixed-size key/value encoding for tree items.
///
/// The body slice handed to the codec excludes the item header and is
/// exactly `item_size() - ITEM_HEADER_SIZE` bytes long.
pub trait ItemCodec: Send + Sync {
    type Key: Clone + Debug + Send;
    type Value: Clone + Debug + Send;

    /// Full item size including the item header.
    fn item_size(&self) -> usize;

    fn decode_key(&self, body: &[u8]) -> Self::Key;

    fn decode_value(&self, body: &[u8]) -> Self::Value;

    fn encode(&self, body: &mut [u8], key: &Self::Key, value: &Self::Value);

    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;
}

/// Object index items: an `i64` id mapped to a packed `u64` entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdIndexCodec;

pub const ID_INDEX_ITEM_SIZE: usize = ITEM_HEADER_SIZE + 16;

impl ItemCodec for IdIndexCodec {
    type Key = i64;
    type Value = u64;

    fn item_size(&self) -> usize {
        ID_INDEX_ITEM_SIZE
    }

    fn decode_key(&self, body: &[u8]) -> i64 {
        LittleEndian::read_i64(&body[0..])
    }

    fn decode_value(&self, body: &[u8]) -> u64 {
        LittleEndian::read_u64(&body[8..])
    }

    fn encode(&self, body: &mut [u8], key: &i64, value: &u64) {
        LittleEndian::write_i64(&mut body[0..], *key);
        LittleEndian::write_u64(&mut body[8..], *value);
    }

    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }
}
