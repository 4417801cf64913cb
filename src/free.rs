use std::collections::{BTreeSet, HashMap};

use bytes::{Buf, BufMut, BytesMut};
use log::error;

use crate::{
  data::{FileKind, FileManager},
  errors::{Errors, Result},
};

/// Size of the `del` file header:
/// `[last_file:2 | last_size:4 | num_sections:4]` — the data-file tail
/// counters of the database plus the number of section records that follow.
pub(crate) const DEL_HEADER_SIZE: usize = 10;

/// On-disk size of one section record:
/// `[active:1 | length_be:4 | file_le:2 | offset_le:4 | reserved:1]`.
pub(crate) const SECTION_SIZE: usize = 12;

/// One free extent inside a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Section {
  pub(crate) len: u32,
  pub(crate) file: u16,
  pub(crate) offset: u32,
  /// Record slot in the `del` file.
  pub(crate) slot: u32,
}

// Largest extent first, so best fit is the first element of the set. The
// length field is stored big-endian on disk for the same reason.
impl Ord for Section {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    other
      .len
      .cmp(&self.len)
      .then(self.file.cmp(&other.file))
      .then(self.offset.cmp(&other.offset))
      .then(self.slot.cmp(&other.slot))
  }
}

impl PartialOrd for Section {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Section {
  fn encode(&self, active: bool) -> [u8; SECTION_SIZE] {
    let mut buf = [0u8; SECTION_SIZE];
    buf[0] = active as u8;
    buf[1..5].copy_from_slice(&self.len.to_be_bytes());
    buf[5..7].copy_from_slice(&self.file.to_le_bytes());
    buf[7..11].copy_from_slice(&self.offset.to_le_bytes());
    buf
  }

  fn decode(slot: u32, mut rec: &[u8]) -> (bool, Self) {
    let active = rec.get_u8() == 1;
    let len = rec.get_u32();
    let file = rec.get_u16_le();
    let offset = rec.get_u32_le();
    (
      active,
      Section {
        len,
        file,
        offset,
        slot,
      },
    )
  }
}

/// The deletion index: free extents inside data files, kept in memory for
/// best-fit allocation and persisted record-per-slot in the `del` file.
///
/// Freed extents stay INACTIVE until the owning commit finalizes, so a
/// failed commit can never leak a live byte range into the free pool.
/// Adjacent extents are not coalesced; the accounting workload produces few
/// near-miss extents, and the simpler records keep recovery trivial.
pub struct FreeList {
  /// Active extents only, largest first.
  sections: BTreeSet<Section>,
  by_slot: HashMap<u32, Section>,
  /// Disk slots currently holding inactive records, available for reuse.
  inactive_slots: Vec<u32>,
  num_slots: u32,
  /// Slot count as of the last flush; later slots are pure appends.
  committed_slots: u32,
  /// Frees staged by the running commit, activated at flush.
  staged: Vec<Section>,
  /// Slots whose records the running commit will rewrite.
  dirty: BTreeSet<u32>,

  max_file_size: u32,
  pub(crate) last_file: u16,
  pub(crate) last_size: u32,
  pub(crate) new_last_file: u16,
  pub(crate) new_last_size: u32,
}

impl FreeList {
  /// Loads the deletion index from the `del` file, creating an empty one on
  /// first open.
  pub fn load(files: &mut FileManager, max_file_size: u32) -> Result<Self> {
    let mut free = FreeList {
      sections: BTreeSet::new(),
      by_slot: HashMap::new(),
      inactive_slots: Vec::new(),
      num_slots: 0,
      committed_slots: 0,
      staged: Vec::new(),
      dirty: BTreeSet::new(),
      max_file_size,
      last_file: 0,
      last_size: 0,
      new_last_file: 0,
      new_last_size: 0,
    };

    if !files.exists(FileKind::DeletionIndex) {
      files.write(FileKind::DeletionIndex, 0, &[0u8; DEL_HEADER_SIZE])?;
      files.sync(FileKind::DeletionIndex)?;
      return Ok(free);
    }

    let scan = files.open_scan(FileKind::DeletionIndex)?;
    let mut header = [0u8; DEL_HEADER_SIZE];
    scan.read(&mut header, 0)?;
    let mut cur = &header[..];
    free.last_file = cur.get_u16_le();
    free.last_size = cur.get_u32_le();
    free.num_slots = cur.get_u32_le();
    free.committed_slots = free.num_slots;
    free.new_last_file = free.last_file;
    free.new_last_size = free.last_size;

    if scan.size() < (DEL_HEADER_SIZE + free.num_slots as usize * SECTION_SIZE) as u64 {
      error!("deletion index holds fewer records than its header claims");
      return Err(Errors::CorruptedDeletionIndex);
    }

    let mut rec = [0u8; SECTION_SIZE];
    for slot in 0..free.num_slots {
      scan.read(
        &mut rec,
        (DEL_HEADER_SIZE + slot as usize * SECTION_SIZE) as u64,
      )?;
      let (active, section) = Section::decode(slot, &rec);
      if active {
        free.sections.insert(section);
        free.by_slot.insert(slot, section);
      } else {
        free.inactive_slots.push(slot);
      }
    }

    Ok(free)
  }

  /// Resets the staged tail counters at the start of a commit.
  pub(crate) fn begin_commit(&mut self) {
    self.new_last_file = self.last_file;
    self.new_last_size = self.last_size;
    self.staged.clear();
    self.dirty.clear();
  }

  /// Places `len` bytes: best fit from the largest active extent, carving
  /// from its high end, or an append at the staged data tail, rolling to a
  /// new data file when the current one cannot hold the value.
  pub(crate) fn allocate(&mut self, len: u32) -> Result<(u16, u32)> {
    if len as u64 > self.max_file_size as u64 {
      return Err(Errors::ValueTooLarge);
    }

    if let Some(best) = self.sections.iter().next().copied() {
      if best.len >= len {
        self.sections.remove(&best);
        self.by_slot.remove(&best.slot);
        self.dirty.insert(best.slot);
        let remainder = best.len - len;
        if remainder > 0 {
          let shrunk = Section {
            len: remainder,
            ..best
          };
          self.sections.insert(shrunk);
          self.by_slot.insert(best.slot, shrunk);
        } else {
          self.inactive_slots.push(best.slot);
        }
        return Ok((best.file, best.offset + remainder));
      }
    }

    if self.new_last_size as u64 + len as u64 > self.max_file_size as u64 {
      self.new_last_file = match self.new_last_file.checked_add(1) {
        Some(file) => file,
        None => return Err(Errors::NoAvailableFileId),
      };
      self.new_last_size = 0;
    }
    let offset = self.new_last_size;
    self.new_last_size += len;
    Ok((self.new_last_file, offset))
  }

  /// Registers a freed extent; it becomes active when the commit flushes.
  pub(crate) fn stage_free(&mut self, file: u16, offset: u32, len: u32) {
    if len == 0 {
      return;
    }
    self.staged.push(Section {
      len,
      file,
      offset,
      slot: u32::MAX,
    });
  }

  /// Assigns disk slots to staged frees and returns the dirty slots that
  /// already exist on disk, for write-ahead before-images. Slots past the
  /// committed count are appends and need none.
  pub(crate) fn prepare_commit(&mut self) -> Vec<u32> {
    for section in self.staged.iter_mut() {
      let slot = match self.inactive_slots.pop() {
        Some(slot) => slot,
        None => {
          let slot = self.num_slots;
          self.num_slots += 1;
          slot
        }
      };
      section.slot = slot;
      self.dirty.insert(slot);
    }
    self
      .dirty
      .iter()
      .copied()
      .filter(|slot| *slot < self.committed_slots)
      .collect()
  }

  /// Activates staged frees, rewrites dirty section records and the header,
  /// and promotes the data-file tail counters.
  pub(crate) fn flush(&mut self, files: &mut FileManager) -> Result<()> {
    for section in std::mem::take(&mut self.staged) {
      self.sections.insert(section);
      self.by_slot.insert(section.slot, section);
    }

    for slot in std::mem::take(&mut self.dirty) {
      let rec = match self.by_slot.get(&slot) {
        Some(section) => section.encode(true),
        None => [0u8; SECTION_SIZE],
      };
      files.write(
        FileKind::DeletionIndex,
        (DEL_HEADER_SIZE + slot as usize * SECTION_SIZE) as u64,
        &rec,
      )?;
    }

    self.last_file = self.new_last_file;
    self.last_size = self.new_last_size;
    self.committed_slots = self.num_slots;

    let mut header = BytesMut::with_capacity(DEL_HEADER_SIZE);
    header.put_u16_le(self.last_file);
    header.put_u32_le(self.last_size);
    header.put_u32_le(self.num_slots);
    files.write(FileKind::DeletionIndex, 0, &header)?;

    Ok(())
  }

  /// Total reclaimable bytes across active extents.
  pub(crate) fn free_bytes(&self) -> u64 {
    self.sections.iter().map(|s| s.len as u64).sum()
  }

  pub(crate) fn data_file_count(&self) -> usize {
    self.last_file as usize + 1
  }

  #[cfg(test)]
  pub(crate) fn contains(&self, file: u16, offset: u32, len: u32) -> bool {
    self
      .sections
      .iter()
      .any(|s| s.file == file && s.offset == offset && s.len == len)
  }
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  fn test_free_list(max_file_size: u32) -> (tempfile::TempDir, FileManager, FreeList) {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let mut files = FileManager::new(temp_dir.path().to_path_buf(), false);
    let free = FreeList::load(&mut files, max_file_size).expect("failed to load free list");
    (temp_dir, files, free)
  }

  #[test]
  fn test_allocate_appends_when_empty() {
    let (_temp_dir, _files, mut free) = test_free_list(1024);
    free.begin_commit();

    assert_eq!((0, 0), free.allocate(100).unwrap());
    assert_eq!((0, 100), free.allocate(50).unwrap());
    assert_eq!(150, free.new_last_size);
  }

  #[test]
  fn test_allocate_rolls_to_next_file() {
    let (_temp_dir, _files, mut free) = test_free_list(1024);
    free.begin_commit();

    assert_eq!((0, 0), free.allocate(1000).unwrap());
    // 100 bytes no longer fit in file 0
    assert_eq!((1, 0), free.allocate(100).unwrap());
    assert_eq!(1, free.new_last_file);
    assert_eq!(100, free.new_last_size);
  }

  #[test]
  fn test_allocate_carves_best_fit_from_high_end() {
    let (_temp_dir, mut files, mut free) = test_free_list(1024);
    free.begin_commit();
    free.stage_free(0, 200, 64);
    free.stage_free(0, 400, 32);
    free.prepare_commit();
    free.flush(&mut files).expect("failed to flush");

    free.begin_commit();
    // largest extent is (0, 200, 64); 40 bytes carve from its high end
    assert_eq!((0, 224), free.allocate(40).unwrap());
    assert!(free.contains(0, 200, 24));

    // 30 bytes fit the (0, 400, 32) extent now that the first shrank to 24
    assert_eq!((0, 402), free.allocate(30).unwrap());
  }

  #[test]
  fn test_allocate_exhausts_extent_and_reuses_slot() {
    let (_temp_dir, mut files, mut free) = test_free_list(1024);
    free.begin_commit();
    free.stage_free(0, 200, 64);
    free.prepare_commit();
    free.flush(&mut files).expect("failed to flush");

    free.begin_commit();
    assert_eq!((0, 200), free.allocate(64).unwrap());
    assert_eq!(0, free.free_bytes());

    // the retired slot is reused by the next staged free
    free.stage_free(1, 0, 16);
    let dirty = free.prepare_commit();
    assert_eq!(vec![0], dirty);
    free.flush(&mut files).expect("failed to flush");
    assert!(free.contains(1, 0, 16));
  }

  #[test]
  fn test_flush_and_reload_round_trip() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let mut files = FileManager::new(temp_dir.path().to_path_buf(), false);

    let mut free = FreeList::load(&mut files, 1024).expect("failed to load free list");
    free.begin_commit();
    let _ = free.allocate(500).unwrap();
    free.stage_free(0, 100, 77);
    free.prepare_commit();
    free.flush(&mut files).expect("failed to flush");

    let reloaded = FreeList::load(&mut files, 1024).expect("failed to reload free list");
    assert_eq!(500, reloaded.last_size);
    assert_eq!(0, reloaded.last_file);
    assert_eq!(77, reloaded.free_bytes());
    assert!(reloaded.contains(0, 100, 77));
  }

  #[test]
  fn test_value_too_large() {
    let (_temp_dir, _files, mut free) = test_free_list(256);
    free.begin_commit();
    assert_eq!(Errors::ValueTooLarge, free.allocate(257).err().unwrap());
  }
}
