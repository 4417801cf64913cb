use bytes::Bytes;
use tempfile::{tempdir, TempDir};

use crate::{
  data::{file_name, FileKind},
  db::Database,
  errors::Errors,
  index::{Comparator, ORDER},
  option::{IndexOptions, Options},
};

fn test_options(temp_dir: &TempDir) -> Options {
  let _ = env_logger::builder().is_test(true).try_init();
  let mut opts = Options::default();
  opts.dir_path = temp_dir.path().to_path_buf();
  opts
}

#[test]
fn test_fresh_write_survives_reopen() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let opts = test_options(&temp_dir);
  let key = [1u8, 0, 0, 0, 0, 0, 0, 0];

  {
    let db = Database::open(opts.clone()).expect("failed to open database");
    db.open_index(IndexOptions::new(3, 8)).expect("failed to open index");
    let mut txn = db.begin();
    txn.put(3, &key, b"A").unwrap();
    txn.commit().expect("failed to commit");
  }

  let db = Database::open(opts).expect("failed to reopen database");
  db.open_index(IndexOptions::new(3, 8)).expect("failed to open index");
  assert_eq!(Bytes::from_static(b"A"), db.get(3, &key).unwrap());
}

#[test]
fn test_iteration_order_and_deletes() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 2)).expect("failed to open index");

  let mut txn = db.begin();
  for i in (0..100u16).rev() {
    txn.put(1, &i.to_be_bytes(), &[i as u8; 64]).unwrap();
  }
  txn.commit().expect("failed to commit");

  let keys = db.list_keys(1).unwrap();
  let expected: Vec<Bytes> = (0..100u16)
    .map(|i| Bytes::copy_from_slice(&i.to_be_bytes()))
    .collect();
  assert_eq!(expected, keys);
  for i in 0..100u16 {
    assert_eq!(Bytes::from(vec![i as u8; 64]), db.get(1, &i.to_be_bytes()).unwrap());
  }

  for i in (0..100u16).step_by(2) {
    txn.delete(1, &i.to_be_bytes()).unwrap();
  }
  txn.commit().expect("failed to commit");

  let keys = db.list_keys(1).unwrap();
  assert_eq!(50, keys.len());
  for i in 0..100u16 {
    let res = db.get(1, &i.to_be_bytes());
    if i % 2 == 0 {
      assert_eq!(Errors::KeyNotFound, res.err().unwrap());
    } else {
      assert!(res.is_ok());
    }
  }
}

#[test]
fn test_subsection_overwrite_in_place() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");

  let base: Vec<u8> = (0..100u8).collect();
  let mut txn = db.begin();
  txn.put(1, b"key0", &base).unwrap();
  txn.commit().expect("failed to commit");

  txn.put_at(1, b"key0", 10, b"XYZ").unwrap();
  txn.commit().expect("failed to commit");

  assert_eq!(Bytes::from_static(b"XYZ"), db.get_range(1, b"key0", 10, 3).unwrap());
  let value = db.get(1, b"key0").unwrap();
  assert_eq!(100, value.len());
  assert_eq!(&base[..10], &value[..10]);
  assert_eq!(&base[13..], &value[13..]);

  // a read past the value behaves as a missing key
  assert_eq!(
    Errors::KeyNotFound,
    db.get_range(1, b"key0", 98, 10).err().unwrap()
  );
}

#[test]
fn test_crash_before_truncate_rolls_back() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let opts = test_options(&temp_dir);

  {
    let db = Database::open(opts.clone()).expect("failed to open database");
    db.open_index(IndexOptions::new(1, 8)).expect("failed to open index");

    // enough keys in one transaction to force at least one root split
    let mut txn = db.begin();
    for i in 0..(ORDER as u64 + 6) {
      txn.put(1, &i.to_be_bytes(), &[0xCD; 32]).unwrap();
    }
    // stop after the data sync, before the log truncates: the crash window
    db.commit_inner(&txn.pending, true).expect("failed to commit");
    drop(txn);
  }

  let db = Database::open(opts).expect("failed to reopen database");
  db.open_index(IndexOptions::new(1, 8)).expect("failed to open index");

  for i in 0..(ORDER as u64 + 6) {
    assert_eq!(
      Errors::KeyNotFound,
      db.get(1, &i.to_be_bytes()).err().unwrap()
    );
  }
  assert!(db.list_keys(1).unwrap().is_empty());

  // the tail counters moved back with the rollback
  let free = db.free.lock();
  assert_eq!(0, free.last_file);
  assert_eq!(0, free.last_size);
}

#[test]
fn test_crash_rolls_back_subsection_overwrite() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let opts = test_options(&temp_dir);

  {
    let db = Database::open(opts.clone()).expect("failed to open database");
    db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");
    let mut txn = db.begin();
    txn.put(1, b"key0", b"unchanged-payload").unwrap();
    txn.commit().expect("failed to commit");

    txn.put_at(1, b"key0", 0, b"CLOBBERED").unwrap();
    db.commit_inner(&txn.pending, true).expect("failed to commit");
    drop(txn);
  }

  let db = Database::open(opts).expect("failed to reopen database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");
  assert_eq!(
    Bytes::from_static(b"unchanged-payload"),
    db.get(1, b"key0").unwrap()
  );
}

#[test]
fn test_full_data_file_rolls_to_next() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let mut opts = test_options(&temp_dir);
  opts.max_file_size = 4096;
  let db = Database::open(opts).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");

  // fill data file 0 to within 10 bytes of the limit
  let mut txn = db.begin();
  txn.put(1, b"fill", &vec![0xAA; 4086]).unwrap();
  txn.commit().expect("failed to commit");

  txn.put(1, b"next", &vec![0xBB; 100]).unwrap();
  txn.commit().expect("failed to commit");

  {
    let indexes = db.indexes.read();
    let mut idx = indexes.get(&1).unwrap().lock();
    let mut files = db.files.lock();
    let value = idx.get(&mut files, b"next").unwrap().unwrap();
    assert_eq!(1, value.file);
    assert_eq!(0, value.pos);
  }
  assert!(file_name(temp_dir.path(), FileKind::Data(1)).is_file());
  assert_eq!(Bytes::from(vec![0xBB; 100]), db.get(1, b"next").unwrap());
}

#[test]
fn test_shrinking_value_frees_tail() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");

  let mut txn = db.begin();
  txn.put(1, b"key0", &vec![0x11; 100]).unwrap();
  txn.commit().expect("failed to commit");

  txn.put(1, b"key0", &vec![0x22; 40]).unwrap();
  txn.commit().expect("failed to commit");

  assert_eq!(Bytes::from(vec![0x22; 40]), db.get(1, b"key0").unwrap());
  // the tail of the old value is an active free extent now
  assert!(db.free.lock().contains(0, 40, 60));

  // and the next fitting value reuses it
  txn.put(1, b"key1", &vec![0x33; 60]).unwrap();
  txn.commit().expect("failed to commit");
  assert!(!db.free.lock().contains(0, 40, 60));
  assert_eq!(Bytes::from(vec![0x33; 60]), db.get(1, b"key1").unwrap());
}

#[test]
fn test_rename_round_trip_law() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");

  let mut txn = db.begin();
  txn.put(1, b"key0", b"tracked-value").unwrap();
  txn.rename(1, b"key0", b"key1").unwrap();
  txn.commit().expect("failed to commit");

  assert_eq!(Bytes::from_static(b"tracked-value"), db.get(1, b"key1").unwrap());
  assert_eq!(Errors::KeyNotFound, db.get(1, b"key0").err().unwrap());
}

#[test]
fn test_growing_value_moves_and_frees_old_range() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");

  let mut txn = db.begin();
  txn.put(1, b"key0", &vec![0x44; 50]).unwrap();
  txn.commit().expect("failed to commit");

  txn.put(1, b"key0", &vec![0x55; 200]).unwrap();
  txn.commit().expect("failed to commit");

  assert_eq!(Bytes::from(vec![0x55; 200]), db.get(1, b"key0").unwrap());
  assert!(db.free.lock().contains(0, 0, 50));
}

#[test]
fn test_commit_without_sync_on_commit() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let mut opts = test_options(&temp_dir);
  opts.sync_on_commit = false;

  {
    let db = Database::open(opts.clone()).expect("failed to open database");
    db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");
    let mut txn = db.begin();
    txn.put(1, b"key0", b"unsynced-but-logged").unwrap();
    txn.commit().expect("failed to commit");
    assert_eq!(
      Bytes::from_static(b"unsynced-but-logged"),
      db.get(1, b"key0").unwrap()
    );
  }

  // without a crash the data is on disk regardless
  let db = Database::open(opts).expect("failed to reopen database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");
  assert_eq!(
    Bytes::from_static(b"unsynced-but-logged"),
    db.get(1, b"key0").unwrap()
  );
}

#[test]
fn test_directory_is_exclusively_locked() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let opts = test_options(&temp_dir);
  let _db = Database::open(opts.clone()).expect("failed to open database");

  let second = Database::open(opts);
  assert_eq!(Errors::DatabaseIsUsing, second.err().unwrap());
}

#[test]
fn test_stat_and_backup() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  db.open_index(IndexOptions::new(1, 4)).expect("failed to open index");

  let mut txn = db.begin();
  txn.put(1, b"key0", &vec![0x66; 100]).unwrap();
  txn.commit().expect("failed to commit");
  txn.delete(1, b"key0").unwrap();
  txn.commit().expect("failed to commit");

  let stat = db.stat().unwrap();
  assert_eq!(1, stat.index_num);
  assert_eq!(1, stat.data_file_num);
  assert_eq!(100, stat.reclaim_size);
  assert!(stat.disk_size > 0);

  let backup_dir = tempdir().expect("failed to create temp dir");
  let backup_path = backup_dir.path().join("copy");
  db.backup(&backup_path).expect("failed to back up");
  drop(db);

  let mut backup_opts = Options::default();
  backup_opts.dir_path = backup_path;
  let restored = Database::open(backup_opts).expect("failed to open backup");
  restored
    .open_index(IndexOptions::new(1, 4))
    .expect("failed to open index");
  assert_eq!(Errors::KeyNotFound, restored.get(1, b"key0").err().unwrap());
}

#[test]
fn test_custom_comparator_drives_iteration() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let db = Database::open(test_options(&temp_dir)).expect("failed to open database");
  let newest_first: Comparator = Box::new(|a: &[u8], b: &[u8]| b.cmp(a));
  db.open_index_with(IndexOptions::new(9, 4), newest_first)
    .expect("failed to open index");

  let mut txn = db.begin();
  for i in 0..10u32 {
    txn.put(9, &i.to_be_bytes(), b"entry").unwrap();
  }
  txn.commit().expect("failed to commit");

  let keys = db.list_keys(9).unwrap();
  let expected: Vec<Bytes> = (0..10u32)
    .rev()
    .map(|i| Bytes::copy_from_slice(&i.to_be_bytes()))
    .collect();
  assert_eq!(expected, keys);
}

#[test]
fn test_many_transactions_across_reopen() {
  let temp_dir = tempdir().expect("failed to create temp dir");
  let opts = test_options(&temp_dir);

  {
    let db = Database::open(opts.clone()).expect("failed to open database");
    db.open_index(IndexOptions::new(1, 16)).expect("failed to open index");
    for batch in 0..20usize {
      let mut txn = db.begin();
      for i in 0..25usize {
        let n = batch * 25 + i;
        txn
          .put(
            1,
            &crate::util::rand_kv::get_test_key(n),
            &crate::util::rand_kv::get_test_value(n),
          )
          .unwrap();
      }
      txn.commit().expect("failed to commit");
    }
  }

  let db = Database::open(opts).expect("failed to reopen database");
  db.open_index(IndexOptions::new(1, 16)).expect("failed to open index");
  assert_eq!(500, db.list_keys(1).unwrap().len());
  for n in 0..500usize {
    assert_eq!(
      crate::util::rand_kv::get_test_value(n),
      db.get(1, &crate::util::rand_kv::get_test_key(n)).unwrap()
    );
  }
}
