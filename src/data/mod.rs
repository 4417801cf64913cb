use std::path::{Path, PathBuf};

use crate::{
  errors::Result,
  fio::{new_io_manager, IOManager},
};

pub const DELETION_INDEX_FILE_NAME: &str = "del";
pub const WAL_FILE_NAME: &str = "log";

/// Size of the `[last_file:2 | last_size:4]` header of index file 0.
pub(crate) const INDEX_HEADER_SIZE: u32 = 6;

/// Identifies one numbered file beneath the database folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileKind {
  /// Shared append-log of value bytes, `dat_<file_no>`.
  Data(u16),

  /// B-tree node storage for one index, `idx_<index_id>_<file_no>`.
  Index { index: u8, file: u16 },

  /// The deletion index singleton, `del`.
  DeletionIndex,

  /// The write-ahead log singleton, `log`.
  Wal,
}

pub fn file_name<P>(dir_path: P, kind: FileKind) -> PathBuf
where
  P: AsRef<Path>,
{
  let name = match kind {
    FileKind::Data(file) => format!("dat_{file}"),
    FileKind::Index { index, file } => format!("idx_{index}_{file}"),
    FileKind::DeletionIndex => DELETION_INDEX_FILE_NAME.to_string(),
    FileKind::Wal => WAL_FILE_NAME.to_string(),
  };
  dir_path.as_ref().join(name)
}

/// Byte-granular access to the database's numbered files.
///
/// Exactly one open handle is cached; requesting a different file closes the
/// cached one and reopens. Writing past the end of a file extends it, which
/// is the only growth operation. Durability is established only by [`sync`]
/// at explicit commit points, never by a write on its own.
///
/// [`sync`]: FileManager::sync
pub struct FileManager {
  dir_path: PathBuf,
  mmap_at_startup: bool,
  cached: Option<(FileKind, Box<dyn IOManager>)>,
}

impl FileManager {
  pub fn new(dir_path: PathBuf, mmap_at_startup: bool) -> Self {
    Self {
      dir_path,
      mmap_at_startup,
      cached: None,
    }
  }

  fn io(&mut self, kind: FileKind) -> Result<&dyn IOManager> {
    let hit = matches!(&self.cached, Some((cached, _)) if *cached == kind);
    if !hit {
      let io = new_io_manager(file_name(&self.dir_path, kind), false)?;
      self.cached = Some((kind, io));
    }
    Ok(self.cached.as_ref().unwrap().1.as_ref())
  }

  pub fn read(&mut self, kind: FileKind, offset: u64, buf: &mut [u8]) -> Result<()> {
    self.io(kind)?.read(buf, offset)?;
    Ok(())
  }

  pub fn write(&mut self, kind: FileKind, offset: u64, bytes: &[u8]) -> Result<()> {
    self.io(kind)?.write(bytes, offset)?;
    Ok(())
  }

  pub fn size(&mut self, kind: FileKind) -> Result<u64> {
    Ok(self.io(kind)?.size())
  }

  pub fn sync(&mut self, kind: FileKind) -> Result<()> {
    self.io(kind)?.sync()
  }

  pub fn exists(&self, kind: FileKind) -> bool {
    file_name(&self.dir_path, kind).is_file()
  }

  /// Opens a standalone reader for a whole-file startup scan, memory-mapped
  /// when the database was opened with `mmap_at_startup`.
  pub fn open_scan(&self, kind: FileKind) -> Result<Box<dyn IOManager>> {
    let use_mmap = self.mmap_at_startup && self.exists(kind);
    new_io_manager(file_name(&self.dir_path, kind), use_mmap)
  }
}
