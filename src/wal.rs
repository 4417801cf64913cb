use std::collections::BTreeSet;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use log::{error, warn};

use crate::{
  data::{file_name, FileKind, FileManager},
  errors::{Errors, Result},
  fio::{file_io::FileIO, IOManager},
};

/// Size of the used-length header; non-zero means recovery is needed.
const WAL_HEADER_SIZE: u64 = 4;

pub(crate) const WAL_FILE_DATA: u8 = 0;
pub(crate) const WAL_FILE_DELETION_INDEX: u8 = 1;
pub(crate) const WAL_FILE_INDEX: u8 = 2;
const WAL_MARKER: u8 = 0xFF;

/// The terminal marker: tail counters of the database and every touched
/// index as they were before the commit started.
pub(crate) struct WalMarker {
  pub(crate) last_file: u16,
  pub(crate) last_size: u32,
  /// `(index_id, last_file, last_size)` per touched index.
  pub(crate) indexes: Vec<(u8, u16, u32)>,
}

struct WalRecord {
  file_type: u8,
  index_id: u8,
  file_id: u16,
  offset: u32,
  prev: Vec<u8>,
}

impl WalRecord {
  fn kind(&self) -> Result<FileKind> {
    match self.file_type {
      WAL_FILE_DATA => Ok(FileKind::Data(self.file_id)),
      WAL_FILE_DELETION_INDEX => Ok(FileKind::DeletionIndex),
      WAL_FILE_INDEX => Ok(FileKind::Index {
        index: self.index_id,
        file: self.file_id,
      }),
      _ => Err(Errors::CorruptedWal),
    }
  }
}

/// The write-ahead log: before-images of every byte range a commit will
/// overwrite, appended and synced before the first destructive write.
///
/// Records for one commit are buffered in memory and hit the file as a
/// single write in [`finish`], followed by the used-length header and one
/// sync. After a successful commit [`truncate`] zeroes the header; a
/// zero-length log equals a completed truncate, which makes a crash during
/// truncation idempotent.
///
/// [`finish`]: Wal::finish
/// [`truncate`]: Wal::truncate
pub struct Wal {
  io: FileIO,
  buf: BytesMut,
}

impl Wal {
  pub fn open<P: AsRef<Path>>(dir_path: P) -> Result<Self> {
    let io = FileIO::new(file_name(dir_path, FileKind::Wal))?;
    Ok(Wal {
      io,
      buf: BytesMut::new(),
    })
  }

  pub fn needs_recovery(&self) -> Result<bool> {
    if self.io.size() < WAL_HEADER_SIZE {
      return Ok(false);
    }
    let mut header = [0u8; 4];
    self.io.read(&mut header, 0)?;
    Ok(u32::from_le_bytes(header) != 0)
  }

  /// Starts buffering records for a new commit.
  pub(crate) fn begin(&mut self) {
    self.buf.clear();
  }

  /// Buffers one before-image record.
  pub(crate) fn record(
    &mut self,
    file_type: u8,
    index_id: u8,
    file_id: u16,
    offset: u32,
    prev: &[u8],
  ) {
    let body_len = 1 + 1 + 2 + 4 + 4 + prev.len() + 4;
    self.buf.put_u32_le(body_len as u32);
    let start = self.buf.len();
    self.buf.put_u8(file_type);
    self.buf.put_u8(index_id);
    self.buf.put_u16_le(file_id);
    self.buf.put_u32_le(offset);
    self.buf.put_u32_le(prev.len() as u32);
    self.buf.put_slice(prev);
    let crc = crc32(&self.buf[start..]);
    self.buf.put_u32_le(crc);
  }

  /// Appends the terminal marker, writes everything plus the used-length
  /// header, and syncs. After this returns, destructive writes may begin.
  pub(crate) fn finish(&mut self, marker: &WalMarker) -> Result<()> {
    let body_len = 1 + 2 + 4 + 1 + marker.indexes.len() * 7 + 4;
    self.buf.put_u32_le(body_len as u32);
    let start = self.buf.len();
    self.buf.put_u8(WAL_MARKER);
    self.buf.put_u16_le(marker.last_file);
    self.buf.put_u32_le(marker.last_size);
    self.buf.put_u8(marker.indexes.len() as u8);
    for (id, last_file, last_size) in marker.indexes.iter() {
      self.buf.put_u8(*id);
      self.buf.put_u16_le(*last_file);
      self.buf.put_u32_le(*last_size);
    }
    let crc = crc32(&self.buf[start..]);
    self.buf.put_u32_le(crc);

    self.io.write(&self.buf, WAL_HEADER_SIZE)?;
    self.io.write(&(self.buf.len() as u32).to_le_bytes(), 0)?;
    self.io.sync()?;
    self.buf.clear();
    Ok(())
  }

  /// Zeroes the used-length header and syncs; the commit is now durable.
  pub(crate) fn truncate(&mut self) -> Result<()> {
    self.io.write(&0u32.to_le_bytes(), 0)?;
    self.io.sync()
  }

  /// Replays the log after a crash: applies before-images in reverse,
  /// restores the marker's tail counters into the file headers, and
  /// truncates. Replaying the same log twice reapplies the same
  /// before-images, so recovery itself may crash and rerun.
  pub fn recover(&mut self, files: &mut FileManager) -> Result<()> {
    let mut header = [0u8; 4];
    self.io.read(&mut header, 0)?;
    let used = u32::from_le_bytes(header) as usize;
    if used == 0 {
      return Ok(());
    }
    warn!("write-ahead log holds {used} bytes, rolling back the interrupted commit");

    let scan = files.open_scan(FileKind::Wal)?;
    let mut payload = vec![0u8; used];
    scan.read(&mut payload, WAL_HEADER_SIZE)?;

    let (records, marker) = parse_log(&payload)?;
    let marker = match marker {
      Some(marker) => marker,
      None => {
        error!("write-ahead log has no terminal marker");
        return Err(Errors::CorruptedWal);
      }
    };

    let mut touched: BTreeSet<FileKind> = BTreeSet::new();
    for record in records.iter().rev() {
      let kind = record.kind()?;
      files.write(kind, record.offset as u64, &record.prev)?;
      touched.insert(kind);
    }

    // tail counters move back through the headers they live in
    let mut db_header = BytesMut::with_capacity(6);
    db_header.put_u16_le(marker.last_file);
    db_header.put_u32_le(marker.last_size);
    files.write(FileKind::DeletionIndex, 0, &db_header)?;
    touched.insert(FileKind::DeletionIndex);

    for (id, last_file, last_size) in marker.indexes.iter() {
      let mut idx_header = BytesMut::with_capacity(6);
      idx_header.put_u16_le(*last_file);
      idx_header.put_u32_le(*last_size);
      let kind = FileKind::Index {
        index: *id,
        file: 0,
      };
      files.write(kind, 0, &idx_header)?;
      touched.insert(kind);
    }

    for kind in touched {
      files.sync(kind)?;
    }
    self.truncate()
  }
}

fn parse_log(payload: &[u8]) -> Result<(Vec<WalRecord>, Option<WalMarker>)> {
  let mut records = Vec::new();
  let mut marker = None;
  let mut cur = payload;

  while cur.has_remaining() {
    if cur.remaining() < 4 {
      return Err(Errors::CorruptedWal);
    }
    let body_len = cur.get_u32_le() as usize;
    if body_len < 5 || cur.remaining() < body_len {
      return Err(Errors::CorruptedWal);
    }
    let body = &cur[..body_len];
    cur.advance(body_len);

    let crc_stored = u32::from_le_bytes(body[body_len - 4..].try_into().unwrap());
    if crc32(&body[..body_len - 4]) != crc_stored {
      error!("write-ahead log record fails its checksum");
      return Err(Errors::InvalidWalRecordCrc);
    }

    let mut body = &body[..body_len - 4];
    let file_type = body.get_u8();
    if file_type == WAL_MARKER {
      let last_file = body.get_u16_le();
      let last_size = body.get_u32_le();
      let count = body.get_u8() as usize;
      if body.remaining() != count * 7 {
        return Err(Errors::CorruptedWal);
      }
      let mut indexes = Vec::with_capacity(count);
      for _ in 0..count {
        indexes.push((body.get_u8(), body.get_u16_le(), body.get_u32_le()));
      }
      marker = Some(WalMarker {
        last_file,
        last_size,
        indexes,
      });
      // the marker is written last; trailing bytes would be corruption
      if cur.has_remaining() {
        return Err(Errors::CorruptedWal);
      }
    } else {
      let index_id = body.get_u8();
      let file_id = body.get_u16_le();
      let offset = body.get_u32_le();
      let prev_len = body.get_u32_le() as usize;
      if body.remaining() != prev_len {
        return Err(Errors::CorruptedWal);
      }
      records.push(WalRecord {
        file_type,
        index_id,
        file_id,
        offset,
        prev: body.to_vec(),
      });
    }
  }

  Ok((records, marker))
}

fn crc32(bytes: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(bytes);
  hasher.finalize()
}
