use std::{
  fs::{File, OpenOptions},
  io::{ErrorKind, Read, Seek, SeekFrom, Write},
  path::Path,
  sync::Arc,
};

use log::error;
use parking_lot::RwLock;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Standard seek-based file I/O.
pub struct FileIO {
  fd: Arc<RwLock<File>>,
}

impl FileIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    match OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(file_name)
    {
      Ok(file) => Ok(FileIO {
        fd: Arc::new(RwLock::new(file)),
      }),
      Err(e) => {
        error!("failed to open database file error: {e}");
        Err(Errors::FailedToOpenFile)
      }
    }
  }
}

impl IOManager for FileIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut fd = self.fd.write();
    if let Err(e) = fd.seek(SeekFrom::Start(offset)) {
      error!("failed to seek in database file error: {e}");
      return Err(Errors::FailedToReadFile);
    }
    match fd.read_exact(buf) {
      Ok(()) => Ok(buf.len()),
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Errors::ReadPastEof),
      Err(e) => {
        error!("failed to read from database file error: {e}");
        Err(Errors::FailedToReadFile)
      }
    }
  }

  fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
    let mut fd = self.fd.write();
    if let Err(e) = fd.seek(SeekFrom::Start(offset)) {
      error!("failed to seek in database file error: {e}");
      return Err(Errors::FailedToWriteFile);
    }
    match fd.write_all(buf) {
      Ok(()) => Ok(buf.len()),
      Err(e) => {
        error!("failed to write to database file error: {e}");
        Err(Errors::FailedToWriteFile)
      }
    }
  }

  fn append(&self, buf: &[u8]) -> Result<u64> {
    let mut fd = self.fd.write();
    let offset = match fd.seek(SeekFrom::End(0)) {
      Ok(offset) => offset,
      Err(e) => {
        error!("failed to seek in database file error: {e}");
        return Err(Errors::FailedToWriteFile);
      }
    };
    match fd.write_all(buf) {
      Ok(()) => Ok(offset),
      Err(e) => {
        error!("failed to append to database file error: {e}");
        Err(Errors::FailedToWriteFile)
      }
    }
  }

  fn sync(&self) -> Result<()> {
    let fd = self.fd.read();
    if let Err(e) = fd.sync_all() {
      error!("failed to sync database file error: {e}");
      return Err(Errors::FailedToSyncFile);
    }
    Ok(())
  }

  fn size(&self) -> u64 {
    let fd = self.fd.read();
    fd.metadata().map(|m| m.len()).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  #[test]
  fn test_file_io_write_and_read() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let path = temp_dir.path().join("fio-test");

    let fio = FileIO::new(&path).expect("failed to open file");
    let write_res1 = fio.write(b"hello world", 0);
    assert_eq!(11, write_res1.unwrap());
    let write_res2 = fio.write(b"WORLD", 6);
    assert_eq!(5, write_res2.unwrap());

    let mut buf = [0u8; 11];
    let read_res = fio.read(&mut buf, 0);
    assert!(read_res.is_ok());
    assert_eq!(b"hello WORLD", &buf);
  }

  #[test]
  fn test_file_io_write_past_end_extends() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let path = temp_dir.path().join("fio-extend");

    let fio = FileIO::new(&path).expect("failed to open file");
    fio.write(b"tail", 10).expect("failed to write");
    assert_eq!(14, fio.size());

    let mut buf = [0u8; 4];
    fio.read(&mut buf, 10).expect("failed to read");
    assert_eq!(b"tail", &buf);
  }

  #[test]
  fn test_file_io_append() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let path = temp_dir.path().join("fio-append");

    let fio = FileIO::new(&path).expect("failed to open file");
    assert_eq!(0, fio.append(b"aaa").unwrap());
    assert_eq!(3, fio.append(b"bbb").unwrap());
    assert_eq!(6, fio.size());
  }

  #[test]
  fn test_file_io_read_past_eof() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let path = temp_dir.path().join("fio-eof");

    let fio = FileIO::new(&path).expect("failed to open file");
    fio.write(b"abc", 0).expect("failed to write");

    let mut buf = [0u8; 8];
    let read_res = fio.read(&mut buf, 0);
    assert_eq!(Errors::ReadPastEof, read_res.err().unwrap());
  }

  #[test]
  fn test_file_io_sync() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let path = temp_dir.path().join("fio-sync");

    let fio = FileIO::new(&path).expect("failed to open file");
    fio.write(b"abc", 0).expect("failed to write");
    assert!(fio.sync().is_ok());
  }
}
