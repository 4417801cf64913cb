use std::{fs::OpenOptions, path::Path};

use log::error;
use memmap2::Mmap;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Read-only memory-mapped I/O, used for whole-file scans at startup.
///
/// The mapping is immutable for its whole lifetime, so reads share it
/// without locking; writes go through [`super::file_io::FileIO`] only.
pub struct MMapIO {
  map: Mmap,
}

impl MMapIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    let file = match OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name)
    {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open database file error: {e}");
        return Err(Errors::FailedToOpenFile);
      }
    };
    match unsafe { Mmap::map(&file) } {
      Ok(map) => Ok(MMapIO { map }),
      Err(e) => {
        error!("failed to map database file error: {e}");
        Err(Errors::FailedToOpenFile)
      }
    }
  }
}

impl IOManager for MMapIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let start = usize::try_from(offset).map_err(|_| Errors::ReadPastEof)?;
    let window = start
      .checked_add(buf.len())
      .and_then(|end| self.map.get(start..end))
      .ok_or(Errors::ReadPastEof)?;
    buf.copy_from_slice(window);
    Ok(buf.len())
  }

  fn write(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
    unimplemented!()
  }

  fn append(&self, _buf: &[u8]) -> Result<u64> {
    unimplemented!()
  }

  fn sync(&self) -> Result<()> {
    unimplemented!()
  }

  fn size(&self) -> u64 {
    self.map.len() as u64
  }
}
