use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  fs::{self, File},
  path::Path,
  sync::Arc,
};

use bytes::Bytes;
use fs2::FileExt;
use log::{error, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
  batch::{overlay, Pending},
  data::{FileKind, FileManager},
  errors::{Errors, Result},
  free::{FreeList, DEL_HEADER_SIZE, SECTION_SIZE},
  index::{default_comparator, BTreeIndex, Comparator, IndexValue},
  option::{IndexOptions, Options},
  util,
  wal::{Wal, WalMarker, WAL_FILE_DATA, WAL_FILE_DELETION_INDEX, WAL_FILE_INDEX},
};

pub(crate) const FILE_LOCK_NAME: &str = "flock";

/// The tallykv storage engine.
///
/// `Database` owns the numbered files beneath one directory and the
/// components layered over them: the single-handle file cache, the
/// deletion index of reclaimable extents, the write-ahead log and the
/// lazily loaded B-tree indexes. All mutations travel through a
/// [`Transaction`] and become durable atomically at commit.
///
/// At most one engine instance may have a directory open; the folder is
/// advisory-locked for the lifetime of the instance. Opening a directory
/// whose write-ahead log is non-empty first rolls the interrupted commit
/// back.
///
/// [`Transaction`]: crate::batch::Transaction
pub struct Database {
  pub(crate) options: Arc<Options>,
  pub(crate) files: Mutex<FileManager>,
  pub(crate) free: Mutex<FreeList>,
  pub(crate) wal: Mutex<Wal>,
  pub(crate) indexes: RwLock<HashMap<u8, Mutex<BTreeIndex>>>,
  commit_lock: Mutex<()>,
  lock_file: File,
}

/// Statistics about the database state.
#[derive(Debug, Clone)]
pub struct Stat {
  /// Number of loaded indexes
  pub index_num: usize,

  /// Number of data files
  pub data_file_num: usize,

  /// Reclaimable bytes tracked by the deletion index
  pub reclaim_size: u64,

  /// Total size of the database directory on disk in bytes
  pub disk_size: u64,
}

impl Database {
  /// Opens a tallykv database instance.
  ///
  /// Creates the directory on first open, takes the advisory folder lock,
  /// rolls back any interrupted commit found in the write-ahead log and
  /// loads the deletion index. Indexes load lazily via [`open_index`].
  ///
  /// # Errors
  ///
  /// Returns an error if the directory cannot be created or accessed, if
  /// another engine instance holds the folder, or if recovery finds the
  /// log corrupted.
  ///
  /// [`open_index`]: Database::open_index
  pub fn open(opts: Options) -> Result<Self> {
    if let Some(e) = check_options(&opts) {
      return Err(e);
    }
    let options = Arc::new(opts);

    let dir_path = &options.dir_path;
    if !dir_path.is_dir() {
      if let Err(e) = fs::create_dir_all(dir_path.as_path()) {
        warn!("failed to create database directory error: {e}");
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let lock_file = match fs::OpenOptions::new()
      .read(true)
      .create(true)
      .append(true)
      .open(dir_path.join(FILE_LOCK_NAME))
    {
      Ok(file) => file,
      Err(e) => {
        warn!("failed to open the database folder lock error: {e}");
        return Err(Errors::FailedToOpenFile);
      }
    };
    if lock_file.try_lock_exclusive().is_err() {
      return Err(Errors::DatabaseIsUsing);
    }

    let mut files = FileManager::new(dir_path.clone(), options.mmap_at_startup);
    let mut wal = Wal::open(dir_path)?;
    if wal.needs_recovery()? {
      wal.recover(&mut files)?;
    }
    let free = FreeList::load(&mut files, options.max_file_size)?;

    Ok(Self {
      options,
      files: Mutex::new(files),
      free: Mutex::new(free),
      wal: Mutex::new(wal),
      indexes: RwLock::new(HashMap::new()),
      commit_lock: Mutex::new(()),
      lock_file,
    })
  }

  /// Loads index `opts.id` under the default lexicographic key ordering,
  /// creating it on first load.
  pub fn open_index(&self, opts: IndexOptions) -> Result<()> {
    self.open_index_with(opts, default_comparator())
  }

  /// Loads an index with an application-supplied key comparator. The same
  /// comparator must be supplied on every load of the index.
  pub fn open_index_with(&self, opts: IndexOptions, cmp: Comparator) -> Result<()> {
    if opts.key_size == 0 {
      return Err(Errors::KeyIsEmpty);
    }
    let mut indexes = self.indexes.write();
    if indexes.contains_key(&opts.id) {
      return Err(Errors::IndexAlreadyLoaded);
    }
    let mut files = self.files.lock();
    let index = BTreeIndex::open(&mut files, &opts, cmp, self.options.max_file_size)?;
    indexes.insert(opts.id, Mutex::new(index));
    Ok(())
  }

  pub(crate) fn key_size(&self, index: u8) -> Result<usize> {
    let indexes = self.indexes.read();
    let idx = indexes.get(&index).ok_or(Errors::IndexNotLoaded)?;
    let key_size = idx.lock().key_size;
    Ok(key_size)
  }

  /// Reads the committed value of `key` in full.
  pub fn get(&self, index: u8, key: &[u8]) -> Result<Bytes> {
    let len = self.value_length(index, key)?;
    self.get_range(index, key, 0, len)
  }

  /// Reads `len` committed bytes at `offset` of `key`'s value. Any byte
  /// outside the value behaves as `KeyNotFound`.
  pub fn get_range(&self, index: u8, key: &[u8], offset: u32, len: u32) -> Result<Bytes> {
    let indexes = self.indexes.read();
    let idx_mutex = indexes.get(&index).ok_or(Errors::IndexNotLoaded)?;
    let mut idx = idx_mutex.lock();
    if key.len() != idx.key_size {
      return Err(Errors::KeyWrongSize);
    }
    let mut files = self.files.lock();
    let value = idx.get(&mut files, key)?.ok_or(Errors::KeyNotFound)?;
    if offset as u64 + len as u64 > value.len as u64 {
      return Err(Errors::KeyNotFound);
    }
    let mut buf = vec![0u8; len as usize];
    files.read(
      FileKind::Data(value.file),
      value.pos as u64 + offset as u64,
      &mut buf,
    )?;
    Ok(Bytes::from(buf))
  }

  /// Length of the committed value of `key`.
  pub fn value_length(&self, index: u8, key: &[u8]) -> Result<u32> {
    let indexes = self.indexes.read();
    let idx_mutex = indexes.get(&index).ok_or(Errors::IndexNotLoaded)?;
    let mut idx = idx_mutex.lock();
    if key.len() != idx.key_size {
      return Err(Errors::KeyWrongSize);
    }
    let mut files = self.files.lock();
    let value = idx.get(&mut files, key)?.ok_or(Errors::KeyNotFound)?;
    Ok(value.len)
  }

  /// Lists the live keys of an index, ascending under its comparator.
  pub fn list_keys(&self, index: u8) -> Result<Vec<Bytes>> {
    let indexes = self.indexes.read();
    let idx_mutex = indexes.get(&index).ok_or(Errors::IndexNotLoaded)?;
    let mut idx = idx_mutex.lock();
    let mut files = self.files.lock();
    idx.keys(&mut files)
  }

  /// Retrieves statistics about the database state.
  pub fn stat(&self) -> Result<Stat> {
    let index_num = self.indexes.read().len();
    let free = self.free.lock();
    Ok(Stat {
      index_num,
      data_file_num: free.data_file_count(),
      reclaim_size: free.free_bytes(),
      disk_size: util::file::dir_disk_size(&self.options.dir_path),
    })
  }

  /// Creates a backup of the database directory, excluding the folder
  /// lock.
  pub fn backup<P>(&self, dir_path: P) -> Result<()>
  where
    P: AsRef<Path>,
  {
    let exclude = &[FILE_LOCK_NAME];
    if let Err(e) = util::file::copy_dir(
      &self.options.dir_path,
      &dir_path.as_ref().to_path_buf(),
      exclude,
    ) {
      error!("failed to copy data directory error: {e}");
      return Err(Errors::FailedToCopyDirectory);
    }
    Ok(())
  }

  /// Syncs every data file and the deletion index to disk. A no-op when
  /// the database was opened with `sync_on_commit` off.
  pub fn sync(&self) -> Result<()> {
    if !self.options.sync_on_commit {
      return Ok(());
    }
    let mut files = self.files.lock();
    let free = self.free.lock();
    for file in 0..=free.last_file {
      if files.exists(FileKind::Data(file)) {
        files.sync(FileKind::Data(file))?;
      }
    }
    files.sync(FileKind::DeletionIndex)
  }

  /// Syncs and releases the folder lock.
  pub fn close(&self) -> Result<()> {
    if !self.options.dir_path.is_dir() {
      return Ok(());
    }
    self.sync()?;
    if let Err(e) = fs2::FileExt::unlock(&self.lock_file) {
      error!("failed to release the database folder lock error: {e}");
    }
    Ok(())
  }

  /// Commits one transaction buffer. See `commit_inner` for the protocol.
  pub(crate) fn commit(&self, pending: &Pending) -> Result<()> {
    self.commit_inner(pending, false)
  }

  /// The commit protocol, in strict order: validate, plan space through
  /// the deletion index, apply index mutations in memory, log before-
  /// images and the tail-counter marker, sync the log, write data, write
  /// nodes back, flush the deletion index, promote tail counters, sync
  /// every touched file, truncate the log.
  ///
  /// A crash before the final truncation rolls back on the next open; a
  /// crash during it is idempotent. `stop_before_truncate` ends the
  /// protocol in that window, standing in for the crash in tests.
  pub(crate) fn commit_inner(&self, pending: &Pending, stop_before_truncate: bool) -> Result<()> {
    if pending.is_empty() {
      return Ok(());
    }
    let _commit = self.commit_lock.lock();

    let mut touched: BTreeSet<u8> = BTreeSet::new();
    for (index, _) in pending.writes.keys() {
      touched.insert(*index);
    }
    for (index, _) in pending.subs.keys() {
      touched.insert(*index);
    }
    for (index, _) in pending.deletes.iter() {
      touched.insert(*index);
    }
    for (index, _, _) in pending.renames.iter() {
      touched.insert(*index);
    }

    let indexes = self.indexes.read();
    let mut guards: BTreeMap<u8, MutexGuard<BTreeIndex>> = BTreeMap::new();
    for index in touched.iter() {
      let guard = indexes.get(index).ok_or(Errors::IndexNotLoaded)?.lock();
      guards.insert(*index, guard);
    }
    let mut files = self.files.lock();
    let mut free = self.free.lock();
    let mut wal = self.wal.lock();

    free.begin_commit();
    for guard in guards.values_mut() {
      guard.begin_commit();
    }

    // the marker carries the pre-commit tail counters
    let marker = WalMarker {
      last_file: free.last_file,
      last_size: free.last_size,
      indexes: guards
        .values()
        .map(|g| (g.id, g.last_file, g.last_size))
        .collect(),
    };

    // ---- validation; nothing is mutated before this passes ----
    let mut moved: HashMap<(u8, Vec<u8>), bool> = HashMap::new();
    for (index, old, new) in pending.renames.iter() {
      let old_entry = (*index, old.clone());
      let exists = match moved.get(&old_entry) {
        Some(exists) => *exists,
        None => guards
          .get_mut(index)
          .unwrap()
          .get(&mut files, old)?
          .is_some(),
      };
      if !exists {
        return Err(Errors::KeyNotFound);
      }
      moved.insert(old_entry, false);
      moved.insert((*index, new.clone()), true);
    }
    for (index, key) in pending.subs.keys() {
      let base = pending
        .resolve_base(*index, key)
        .ok_or(Errors::SubsectionWithoutBase)?;
      let exists = guards
        .get_mut(index)
        .unwrap()
        .get(&mut files, &base)?
        .is_some();
      if !exists {
        return Err(Errors::SubsectionWithoutBase);
      }
    }

    // ---- space planning ----
    // `sim` carries each entry's post-rename placement so later phases
    // see the values earlier phases decided on
    let mut sim: HashMap<(u8, Vec<u8>), Option<IndexValue>> = HashMap::new();
    let mut write_plans: Vec<WritePlan> = Vec::new();
    let mut sub_plans: Vec<SubPlan> = Vec::new();
    let mut delete_plans: Vec<(u8, Vec<u8>)> = Vec::new();

    for (index, old, new) in pending.renames.iter() {
      let value = planned_value(&sim, &mut guards, &mut files, *index, old)?
        .ok_or(Errors::KeyNotFound)?;
      if let Some(prev) = planned_value(&sim, &mut guards, &mut files, *index, new)? {
        // the rename lands on an existing entry whose bytes come free
        free.stage_free(prev.file, prev.pos, prev.len);
      }
      sim.insert((*index, old.clone()), None);
      sim.insert((*index, new.clone()), Some(value));
    }

    for (index, key) in pending.deletes.iter() {
      // deleting an absent key is a no-op
      if let Some(value) = planned_value(&sim, &mut guards, &mut files, *index, key)? {
        free.stage_free(value.file, value.pos, value.len);
        delete_plans.push((*index, key.clone()));
        sim.insert((*index, key.clone()), None);
      }
    }

    // subsections stay in place when they fit; past the end they grow the
    // value, which becomes a whole-value rewrite
    let mut full_writes: Vec<(u8, Vec<u8>, Vec<u8>)> = pending
      .writes
      .iter()
      .map(|((index, key), value)| (*index, key.clone(), value.clone()))
      .collect();
    for ((index, key), subs) in pending.subs.iter() {
      let base = planned_value(&sim, &mut guards, &mut files, *index, key)?
        .ok_or(Errors::SubsectionWithoutBase)?;
      let max_end = subs
        .iter()
        .map(|(off, bytes)| *off as u64 + bytes.len() as u64)
        .max()
        .unwrap_or(0);
      if max_end > base.len as u64 {
        let mut value = vec![0u8; base.len as usize];
        files.read(FileKind::Data(base.file), base.pos as u64, &mut value)?;
        for (off, bytes) in subs.iter() {
          overlay(&mut value, *off as usize, bytes);
        }
        full_writes.push((*index, key.clone(), value));
      } else {
        for (off, bytes) in subs.iter() {
          sub_plans.push(SubPlan {
            file: base.file,
            pos: base.pos + *off,
            bytes: bytes.clone(),
          });
        }
      }
    }

    for (index, key, bytes) in full_writes.into_iter() {
      let len = bytes.len() as u32;
      let existing = planned_value(&sim, &mut guards, &mut files, index, &key)?;
      let (file, pos, before_len) = match existing {
        Some(old) if len <= old.len => {
          // shrinking values stay in place; the tail comes free
          if len < old.len {
            free.stage_free(old.file, old.pos + len, old.len - len);
          }
          (old.file, old.pos, len)
        }
        Some(old) => {
          let (file, pos) = free.allocate(len)?;
          free.stage_free(old.file, old.pos, old.len);
          (file, pos, 0)
        }
        None => {
          let (file, pos) = free.allocate(len)?;
          (file, pos, 0)
        }
      };
      sim.insert(
        (index, key.clone()),
        Some(IndexValue {
          key: key.clone(),
          file,
          pos,
          len,
        }),
      );
      write_plans.push(WritePlan {
        index,
        key,
        bytes,
        file,
        pos,
        before_len,
      });
    }

    // ---- index mutations, in memory only until write-back ----
    for (index, old, new) in pending.renames.iter() {
      let idx = guards.get_mut(index).unwrap();
      let value = idx
        .get(&mut files, old)?
        .ok_or(Errors::KeyNotFound)?;
      idx.delete(&mut files, old)?;
      idx.insert(
        &mut files,
        IndexValue {
          key: new.clone(),
          ..value
        },
      )?;
    }
    for (index, key) in delete_plans.iter() {
      guards.get_mut(index).unwrap().delete(&mut files, key)?;
    }
    for plan in write_plans.iter() {
      guards.get_mut(&plan.index).unwrap().insert(
        &mut files,
        IndexValue {
          key: plan.key.clone(),
          file: plan.file,
          pos: plan.pos,
          len: plan.bytes.len() as u32,
        },
      )?;
    }

    // ---- before-images; the disk still holds the pre-commit state ----
    wal.begin();
    let mut del_header = [0u8; DEL_HEADER_SIZE];
    files.read(FileKind::DeletionIndex, 0, &mut del_header)?;
    wal.record(WAL_FILE_DELETION_INDEX, 0, 0, 0, &del_header);
    for slot in free.prepare_commit() {
      let mut rec = [0u8; SECTION_SIZE];
      let offset = (DEL_HEADER_SIZE + slot as usize * SECTION_SIZE) as u64;
      files.read(FileKind::DeletionIndex, offset, &mut rec)?;
      wal.record(WAL_FILE_DELETION_INDEX, 0, 0, offset as u32, &rec);
    }
    for (id, idx) in guards.iter() {
      for loc in idx.dirty_locs() {
        let mut node = vec![0u8; idx.node_size()];
        files.read(
          FileKind::Index {
            index: *id,
            file: loc.file,
          },
          loc.offset as u64,
          &mut node,
        )?;
        wal.record(WAL_FILE_INDEX, *id, loc.file, loc.offset, &node);
      }
    }
    for plan in write_plans.iter().filter(|p| p.before_len > 0) {
      let mut prev = vec![0u8; plan.before_len as usize];
      files.read(FileKind::Data(plan.file), plan.pos as u64, &mut prev)?;
      wal.record(WAL_FILE_DATA, 0, plan.file, plan.pos, &prev);
    }
    for plan in sub_plans.iter() {
      let mut prev = vec![0u8; plan.bytes.len()];
      files.read(FileKind::Data(plan.file), plan.pos as u64, &mut prev)?;
      wal.record(WAL_FILE_DATA, 0, plan.file, plan.pos, &prev);
    }
    wal.finish(&marker)?;

    // ---- destructive writes may begin ----
    let mut data_files: BTreeSet<u16> = BTreeSet::new();
    for plan in write_plans.iter() {
      files.write(FileKind::Data(plan.file), plan.pos as u64, &plan.bytes)?;
      data_files.insert(plan.file);
    }
    for plan in sub_plans.iter() {
      files.write(FileKind::Data(plan.file), plan.pos as u64, &plan.bytes)?;
      data_files.insert(plan.file);
    }

    for idx in guards.values_mut() {
      idx.write_back(&mut files)?;
    }
    free.flush(&mut files)?;
    for idx in guards.values_mut() {
      idx.promote(&mut files)?;
    }

    if self.options.sync_on_commit {
      for file in data_files {
        files.sync(FileKind::Data(file))?;
      }
      for (id, idx) in guards.iter() {
        for file in idx.touched_files() {
          files.sync(FileKind::Index { index: *id, file })?;
        }
      }
      files.sync(FileKind::DeletionIndex)?;
    }

    if stop_before_truncate {
      return Ok(());
    }

    wal.truncate()?;
    for idx in guards.values_mut() {
      idx.end_commit();
    }
    Ok(())
  }
}

impl Drop for Database {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("error while closing database {e}");
    }
  }
}

struct WritePlan {
  index: u8,
  key: Vec<u8>,
  bytes: Vec<u8>,
  file: u16,
  pos: u32,
  /// Live bytes being overwritten in place, for the before-image; zero
  /// when the target range was free or appended.
  before_len: u32,
}

struct SubPlan {
  file: u16,
  pos: u32,
  bytes: Vec<u8>,
}

/// The entry a key resolves to mid-planning: the simulated placement when
/// an earlier phase decided one, the committed entry otherwise.
fn planned_value<'a>(
  sim: &HashMap<(u8, Vec<u8>), Option<IndexValue>>,
  guards: &mut BTreeMap<u8, MutexGuard<'a, BTreeIndex>>,
  files: &mut FileManager,
  index: u8,
  key: &[u8],
) -> Result<Option<IndexValue>> {
  if let Some(value) = sim.get(&(index, key.to_vec())) {
    return Ok(value.clone());
  }
  guards.get_mut(&index).unwrap().get(files, key)
}

fn check_options(opts: &Options) -> Option<Errors> {
  let dir_path = opts.dir_path.to_str();
  if dir_path.is_none() || dir_path.unwrap().is_empty() {
    return Some(Errors::DirPathIsEmpty);
  }
  if opts.max_file_size == 0 {
    return Some(Errors::MaxFileSizeTooSmall);
  }
  None
}
