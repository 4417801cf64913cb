use lazy_static::lazy_static;
use std::path::PathBuf;

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("tallykv");
}

/// Upper bound for any data or index file. 2 GiB keeps offsets well inside
/// the 32-bit range used by index records.
pub const DEFAULT_MAX_FILE_SIZE: u32 = 2 * 1024 * 1024 * 1024;

/// Default per-index byte budget for memory-cached B-tree nodes.
pub const DEFAULT_INDEX_CACHE_LIMIT: usize = 4 * 1024 * 1024;

/// Database-wide configuration.
#[derive(Debug, Clone)]
pub struct Options {
  /// Directory the database lives in; created on first open.
  pub dir_path: PathBuf,

  /// A data or index file is full once a write would push it past this size;
  /// the next write rolls over to a freshly numbered file.
  pub max_file_size: u32,

  /// Sync data, index and deletion-index files at the commit points.
  /// Disabling trades durability of recent commits for throughput; the
  /// write-ahead log is still synced, so a crash never corrupts the store.
  pub sync_on_commit: bool,

  /// Memory-map whole-file scans at startup (write-ahead log replay and
  /// deletion index load) instead of going through buffered reads.
  pub mmap_at_startup: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      max_file_size: DEFAULT_MAX_FILE_SIZE,
      sync_on_commit: true,
      mmap_at_startup: true,
    }
  }
}

/// Per-index configuration handed to [`crate::db::Database::open_index`].
#[derive(Debug, Clone)]
pub struct IndexOptions {
  /// Single-byte index id, unique within the database.
  pub id: u8,

  /// Fixed key length in bytes; every key in the index must match it.
  pub key_size: usize,

  /// Byte budget for memory-cached nodes of this index.
  pub cache_limit: usize,
}

impl IndexOptions {
  pub fn new(id: u8, key_size: usize) -> Self {
    Self {
      id,
      key_size,
      cache_limit: DEFAULT_INDEX_CACHE_LIMIT,
    }
  }
}
