pub mod btree;

use std::cmp::Ordering;

use bytes::{Buf, BufMut, BytesMut};

pub use btree::BTreeIndex;

/// Elements per B-tree node; nodes split once an insert would exceed it.
pub const ORDER: usize = 64;

/// Marks a tombstoned index element. The same constant signals "overwrite
/// from scratch" when passed as the offset of a subsection write.
pub const DELETED_SENTINEL: u32 = 0xFFFF_FFFF;

/// Per-index key ordering, supplied when the index is loaded.
pub type Comparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// The default comparator: lexicographic over the fixed-length key.
pub fn default_comparator() -> Comparator {
  Box::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Position of a node inside an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiskLoc {
  pub(crate) file: u16,
  pub(crate) offset: u32,
}

/// One index element: a key and the data-file range holding its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexValue {
  pub(crate) key: Vec<u8>,
  pub(crate) file: u16,
  pub(crate) pos: u32,
  pub(crate) len: u32,
}

impl IndexValue {
  pub(crate) fn is_tombstone(&self) -> bool {
    self.len == DELETED_SENTINEL
  }

  pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
    buf.put_slice(&self.key);
    buf.put_u16_le(self.file);
    buf.put_u32_le(self.pos);
    buf.put_u32_le(self.len);
  }

  pub(crate) fn decode(key_size: usize, mut rec: &[u8]) -> Self {
    let key = rec[..key_size].to_vec();
    rec.advance(key_size);
    IndexValue {
      key,
      file: rec.get_u16_le(),
      pos: rec.get_u32_le(),
      len: rec.get_u32_le(),
    }
  }
}

/// Serialized size of one element record.
pub(crate) fn element_size(key_size: usize) -> usize {
  key_size + 2 + 4 + 4
}

/// Serialized size of one node.
pub(crate) fn node_size(key_size: usize) -> usize {
  1 + ORDER * element_size(key_size) + (ORDER + 1) * 6
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_index_value_round_trip() {
    let value = IndexValue {
      key: b"deadbeef".to_vec(),
      file: 7,
      pos: 4096,
      len: 120,
    };
    let mut buf = BytesMut::new();
    value.encode_into(&mut buf);
    assert_eq!(element_size(8), buf.len());
    assert_eq!(value, IndexValue::decode(8, &buf));
  }

  #[test]
  fn test_node_size() {
    // 1 count byte, 64 elements of 18 bytes, 65 child pointers of 6 bytes
    assert_eq!(1 + 64 * 18 + 65 * 6, node_size(8));
  }
}
