pub mod file_io;
pub mod mmap;

use std::path::Path;

use crate::errors::Result;

use self::{file_io::FileIO, mmap::MMapIO};

/// Abstract I/O management interface over a single database file.
pub trait IOManager: Sync + Send {
  /// Fills `buf` from `offset`; the whole range must lie inside the file.
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

  /// Writes `buf` at `offset`, extending the file when past the end.
  fn write(&self, buf: &[u8], offset: u64) -> Result<usize>;

  /// Appends `buf`, returning the offset the write began at.
  fn append(&self, buf: &[u8]) -> Result<u64>;

  fn sync(&self) -> Result<()>;

  fn size(&self) -> u64;
}

pub fn new_io_manager<P>(filename: P, use_mmap: bool) -> Result<Box<dyn IOManager>>
where
  P: AsRef<Path>,
{
  match use_mmap {
    true => Ok(Box::new(MMapIO::new(filename)?)),
    false => Ok(Box::new(FileIO::new(filename)?)),
  }
}
