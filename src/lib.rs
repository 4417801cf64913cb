//! tallykv: an embedded, transactional key-value storage engine for a
//! cryptocurrency node's accounting subsystem.
//!
//! The engine maintains ordered B-tree indexes mapping fixed-length binary
//! keys to variable-length values in append-only data files, with
//! crash-safe commits through a before-image write-ahead log, best-fit
//! free-space reclamation and an in-memory transaction buffer that
//! delivers batched modifications atomically.
//!
//! # Features
//!
//! * Order-64 on-disk B-tree indexes with a memory-cached upper tree
//! * Pluggable per-index key comparators
//! * Atomic transactions: full writes, subsection overwrites, deletes and
//!   key renames
//! * Best-fit reuse of freed value space inside existing data files
//! * Write-ahead logging with idempotent crash recovery
//!
//! # Basic Usage
//!
//! ```
//! use tallykv::{db::Database, option::{IndexOptions, Options}};
//!
//! let mut opts = Options::default();
//! opts.dir_path = std::env::temp_dir().join("tallykv-doc");
//! let db = Database::open(opts).expect("failed to open database");
//! db.open_index(IndexOptions::new(1, 8)).expect("failed to open index");
//!
//! let mut txn = db.begin();
//! txn.put(1, b"account1", b"balance").expect("failed to put");
//! txn.commit().expect("failed to commit");
//!
//! let value = db.get(1, b"account1").expect("failed to get");
//! assert_eq!(&value[..], b"balance");
//! ```

mod data;
mod fio;
mod free;
mod wal;

pub mod batch;
pub mod db;
#[cfg(test)]
mod db_test;
pub mod errors;
pub mod index;
pub mod option;
pub mod schema;
pub mod util;
