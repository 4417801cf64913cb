use bytes::Bytes;

/// Deterministic 16-byte test key.
pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(format!("tallykv-{:08}", i % 100_000_000))
}

/// Deterministic test value of a few dozen bytes.
pub fn get_test_value(i: usize) -> Bytes {
  Bytes::from(format!("tallykv-value-for-accounting-entry-{:08}", i))
}
