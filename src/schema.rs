//! The accounter schema: the index families a cryptocurrency node's
//! accounting subsystem projects transaction events into.
//!
//! The engine knows nothing of this schema beyond fixed key sizes and
//! comparators; every key layout below is big-endian so the default
//! lexicographic comparator orders ids and timestamps numerically.

use bytes::Bytes;

use crate::{db::Database, errors::Result, option::IndexOptions};

/// `tx_hash (32) → tx_id (8)`
pub const TX_HASH: u8 = 1;
/// `tx_id (8) → tx_details`
pub const TX_DETAILS: u8 = 2;
/// `branch (1) || tx_id (8) → branch_tx_details`
pub const BRANCH_TX_DETAILS: u8 = 3;
/// `output_id (8) → output_details`
pub const OUTPUT_DETAILS: u8 = 4;
/// `branch (1) || output_id (8) → spent_flag (1)`
pub const BRANCH_OUTPUT_SPENT: u8 = 5;
/// `account (8) || tx_id (8) → account_tx_details`
pub const ACCOUNT_TX_DETAILS: u8 = 6;
/// `branch (1) || account (8) || timestamp (8) || tx_id (8) → ∅`,
/// a sorted time index over an account's transactions
pub const ACCOUNT_TIME_TX: u8 = 7;

const FAMILIES: [(u8, usize); 7] = [
  (TX_HASH, 32),
  (TX_DETAILS, 8),
  (BRANCH_TX_DETAILS, 9),
  (OUTPUT_DETAILS, 8),
  (BRANCH_OUTPUT_SPENT, 9),
  (ACCOUNT_TX_DETAILS, 16),
  (ACCOUNT_TIME_TX, 25),
];

pub fn tx_details_key(tx_id: u64) -> [u8; 8] {
  tx_id.to_be_bytes()
}

pub fn branch_tx_key(branch: u8, tx_id: u64) -> [u8; 9] {
  let mut key = [0u8; 9];
  key[0] = branch;
  key[1..9].copy_from_slice(&tx_id.to_be_bytes());
  key
}

pub fn output_key(output_id: u64) -> [u8; 8] {
  output_id.to_be_bytes()
}

pub fn branch_output_key(branch: u8, output_id: u64) -> [u8; 9] {
  let mut key = [0u8; 9];
  key[0] = branch;
  key[1..9].copy_from_slice(&output_id.to_be_bytes());
  key
}

pub fn account_tx_key(account: u64, tx_id: u64) -> [u8; 16] {
  let mut key = [0u8; 16];
  key[0..8].copy_from_slice(&account.to_be_bytes());
  key[8..16].copy_from_slice(&tx_id.to_be_bytes());
  key
}

pub fn account_time_key(branch: u8, account: u64, timestamp: u64, tx_id: u64) -> [u8; 25] {
  let mut key = [0u8; 25];
  key[0] = branch;
  key[1..9].copy_from_slice(&account.to_be_bytes());
  key[9..17].copy_from_slice(&timestamp.to_be_bytes());
  key[17..25].copy_from_slice(&tx_id.to_be_bytes());
  key
}

/// The accounter's view of a database with every index family loaded.
pub struct Accounter<'a> {
  db: &'a Database,
}

impl<'a> Accounter<'a> {
  /// Opens all accounter index families on `db`.
  pub fn attach(db: &'a Database) -> Result<Self> {
    for (id, key_size) in FAMILIES {
      db.open_index(IndexOptions::new(id, key_size))?;
    }
    Ok(Accounter { db })
  }

  pub fn db(&self) -> &Database {
    self.db
  }

  /// An account's transaction ids on one branch, oldest first. The time
  /// index key layout makes this a plain prefix scan.
  pub fn account_history(&self, branch: u8, account: u64) -> Result<Vec<u64>> {
    let mut prefix = [0u8; 9];
    prefix[0] = branch;
    prefix[1..9].copy_from_slice(&account.to_be_bytes());

    let keys = self.db.list_keys(ACCOUNT_TIME_TX)?;
    Ok(
      keys
        .iter()
        .filter(|key| key.starts_with(&prefix))
        .map(|key| u64::from_be_bytes(key[17..25].try_into().unwrap()))
        .collect(),
    )
  }

  /// Whether an output is marked spent on one branch.
  pub fn is_spent(&self, branch: u8, output_id: u64) -> Result<bool> {
    match self.db.get(BRANCH_OUTPUT_SPENT, &branch_output_key(branch, output_id)) {
      Ok(flag) => Ok(flag == Bytes::from_static(&[1])),
      Err(crate::errors::Errors::KeyNotFound) => Ok(false),
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use crate::option::Options;

  use super::*;

  fn test_accounter_db() -> (tempfile::TempDir, Database) {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let mut opts = Options::default();
    opts.dir_path = temp_dir.path().to_path_buf();
    let db = Database::open(opts).expect("failed to open database");
    (temp_dir, db)
  }

  #[test]
  fn test_attach_loads_all_families() {
    let (_temp_dir, db) = test_accounter_db();
    let _accounter = Accounter::attach(&db).expect("failed to attach accounter");
    assert_eq!(7, db.stat().unwrap().index_num);
  }

  #[test]
  fn test_time_index_orders_history() {
    let (_temp_dir, db) = test_accounter_db();
    let accounter = Accounter::attach(&db).expect("failed to attach accounter");

    let mut txn = db.begin();
    // recorded out of order; the index key layout sorts them by timestamp
    for (timestamp, tx_id) in [(900u64, 31u64), (100, 17), (500, 23)] {
      txn
        .put(ACCOUNT_TIME_TX, &account_time_key(0, 42, timestamp, tx_id), b"")
        .unwrap();
    }
    // another branch and another account must not leak into the scan
    txn
      .put(ACCOUNT_TIME_TX, &account_time_key(1, 42, 200, 99), b"")
      .unwrap();
    txn
      .put(ACCOUNT_TIME_TX, &account_time_key(0, 43, 300, 77), b"")
      .unwrap();
    txn.commit().expect("failed to commit");

    assert_eq!(vec![17, 23, 31], accounter.account_history(0, 42).unwrap());
    assert_eq!(vec![99], accounter.account_history(1, 42).unwrap());
  }

  #[test]
  fn test_spent_flags() {
    let (_temp_dir, db) = test_accounter_db();
    let accounter = Accounter::attach(&db).expect("failed to attach accounter");

    assert!(!accounter.is_spent(0, 7).unwrap());

    let mut txn = db.begin();
    txn
      .put(BRANCH_OUTPUT_SPENT, &branch_output_key(0, 7), &[1])
      .unwrap();
    txn.commit().expect("failed to commit");

    assert!(accounter.is_spent(0, 7).unwrap());
    assert!(!accounter.is_spent(1, 7).unwrap());
  }

  #[test]
  fn test_tx_lookup_round_trip() {
    let (_temp_dir, db) = test_accounter_db();
    let _accounter = Accounter::attach(&db).expect("failed to attach accounter");

    let hash = [0xAB; 32];
    let mut txn = db.begin();
    txn.put(TX_HASH, &hash, &tx_details_key(12)).unwrap();
    txn
      .put(TX_DETAILS, &tx_details_key(12), b"tx-details-bytes")
      .unwrap();
    txn.commit().expect("failed to commit");

    let tx_id = db.get(TX_HASH, &hash).unwrap();
    assert_eq!(&tx_details_key(12)[..], &tx_id[..]);
    let details = db.get(TX_DETAILS, &tx_id).unwrap();
    assert_eq!(Bytes::from_static(b"tx-details-bytes"), details);
  }
}
