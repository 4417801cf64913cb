use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::{
  db::Database,
  errors::{Errors, Result},
  index::DELETED_SENTINEL,
};

/// Buffered state of one transaction, keyed by `(index, key)`.
///
/// The coalescing rules keep the four collections disjoint per key: a full
/// write supersedes subsections and cancels a delete, a delete drops
/// pending writes, and a rename retargets a pending write of its source.
/// Commit replays the remainder as renames, then deletes, then writes,
/// then subsection overwrites, which reproduces submission order.
#[derive(Default)]
pub(crate) struct Pending {
  /// Full-value replacements, at most one per key.
  pub(crate) writes: BTreeMap<(u8, Vec<u8>), Vec<u8>>,
  /// Subsection overwrites in submission order, for keys with no pending
  /// full write.
  pub(crate) subs: BTreeMap<(u8, Vec<u8>), Vec<(u32, Vec<u8>)>>,
  pub(crate) deletes: BTreeSet<(u8, Vec<u8>)>,
  /// Key renames `(index, old, new)` in submission order.
  pub(crate) renames: Vec<(u8, Vec<u8>, Vec<u8>)>,
}

impl Pending {
  pub(crate) fn is_empty(&self) -> bool {
    self.writes.is_empty()
      && self.subs.is_empty()
      && self.deletes.is_empty()
      && self.renames.is_empty()
  }

  pub(crate) fn clear(&mut self) {
    self.writes.clear();
    self.subs.clear();
    self.deletes.clear();
    self.renames.clear();
  }

  /// The committed key a read of `key` lands on once pending renames
  /// apply: the rename source (followed through chains), the key itself,
  /// or `None` when the key has been renamed away.
  pub(crate) fn resolve_base(&self, index: u8, key: &[u8]) -> Option<Vec<u8>> {
    let mut cur = key.to_vec();
    for (idx, old, new) in self.renames.iter().rev() {
      if *idx != index {
        continue;
      }
      if *new == cur {
        cur = old.clone();
      } else if *old == cur {
        return None;
      }
    }
    Some(cur)
  }
}

/// A live transaction: an in-memory staging area whose operations become
/// visible to its own reads immediately and to the database atomically at
/// [`commit`]. Dropping the transaction discards all buffered state.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'a> {
  db: &'a Database,
  pub(crate) pending: Pending,
}

impl Database {
  /// Begins a new, empty transaction.
  pub fn begin(&self) -> Transaction {
    Transaction {
      db: self,
      pending: Pending::default(),
    }
  }
}

impl Transaction<'_> {
  fn check_key(&self, index: u8, key: &[u8]) -> Result<()> {
    if key.len() != self.db.key_size(index)? {
      return Err(Errors::KeyWrongSize);
    }
    Ok(())
  }

  /// Stages a full replacement of `key`'s value. Replaces any pending
  /// write for the same key and cancels a pending delete.
  pub fn put(&mut self, index: u8, key: &[u8], value: &[u8]) -> Result<()> {
    self.check_key(index, key)?;
    if value.len() as u64 >= DELETED_SENTINEL as u64 {
      return Err(Errors::ValueTooLarge);
    }
    let entry = (index, key.to_vec());
    self.pending.deletes.remove(&entry);
    self.pending.subs.remove(&entry);
    self.pending.writes.insert(entry, value.to_vec());
    Ok(())
  }

  /// Stages one write whose value is the concatenation of `parts`.
  pub fn put_concat(&mut self, index: u8, key: &[u8], parts: &[&[u8]]) -> Result<()> {
    self.put(index, key, &parts.concat())
  }

  /// Stages a subsection overwrite of `bytes` at `offset` inside `key`'s
  /// value, which must exist either committed or as a pending write.
  /// Passing [`DELETED_SENTINEL`] as the offset replaces the value from
  /// scratch.
  pub fn put_at(&mut self, index: u8, key: &[u8], offset: u32, bytes: &[u8]) -> Result<()> {
    if offset == DELETED_SENTINEL {
      return self.put(index, key, bytes);
    }
    self.check_key(index, key)?;
    let entry = (index, key.to_vec());
    if self.pending.deletes.contains(&entry) {
      return Err(Errors::SubsectionWithoutBase);
    }
    if let Some(buf) = self.pending.writes.get_mut(&entry) {
      // folded straight into the pending replacement
      overlay(buf, offset as usize, bytes);
      return Ok(());
    }
    let base = self
      .pending
      .resolve_base(index, key)
      .ok_or(Errors::SubsectionWithoutBase)?;
    match self.db.value_length(index, &base) {
      Ok(_) => {}
      Err(Errors::KeyNotFound) => return Err(Errors::SubsectionWithoutBase),
      Err(e) => return Err(e),
    }
    self
      .pending
      .subs
      .entry(entry)
      .or_default()
      .push((offset, bytes.to_vec()));
    Ok(())
  }

  /// Stages a delete of `key`, dropping any pending writes for it.
  pub fn delete(&mut self, index: u8, key: &[u8]) -> Result<()> {
    self.check_key(index, key)?;
    let entry = (index, key.to_vec());
    self.pending.writes.remove(&entry);
    self.pending.subs.remove(&entry);
    self.pending.deletes.insert(entry);
    Ok(())
  }

  /// Stages a rename of `old` to `new`. A pending write of `old` is
  /// retargeted; otherwise the rename is recorded and moves the committed
  /// entry at commit. Either way `new`'s previous value is superseded.
  pub fn rename(&mut self, index: u8, old: &[u8], new: &[u8]) -> Result<()> {
    self.check_key(index, old)?;
    self.check_key(index, new)?;
    if old == new {
      return Ok(());
    }
    let old_entry = (index, old.to_vec());
    let new_entry = (index, new.to_vec());
    // renaming a key this transaction already deleted
    if self.pending.deletes.contains(&old_entry) {
      return Err(Errors::KeyNotFound);
    }
    self.pending.deletes.remove(&new_entry);
    self.pending.writes.remove(&new_entry);
    self.pending.subs.remove(&new_entry);
    if let Some(value) = self.pending.writes.remove(&old_entry) {
      self.pending.writes.insert(new_entry, value);
      self.pending.deletes.insert(old_entry);
    } else {
      if let Some(subs) = self.pending.subs.remove(&old_entry) {
        self.pending.subs.insert(new_entry, subs);
      }
      self.pending.renames.push((index, old.to_vec(), new.to_vec()));
    }
    Ok(())
  }

  /// Reads `key`'s whole value, buffered state first.
  pub fn get(&self, index: u8, key: &[u8]) -> Result<Bytes> {
    let len = self.value_length(index, key)?;
    self.get_range(index, key, 0, len)
  }

  /// Reads `len` bytes at `offset` of `key`'s value: a pending full write
  /// serves from its bytes, pending subsections overlay a committed base
  /// read, and a pending delete reads as `KeyNotFound`.
  pub fn get_range(&self, index: u8, key: &[u8], offset: u32, len: u32) -> Result<Bytes> {
    self.check_key(index, key)?;
    let entry = (index, key.to_vec());
    if self.pending.deletes.contains(&entry) {
      return Err(Errors::KeyNotFound);
    }
    if let Some(buf) = self.pending.writes.get(&entry) {
      return slice_window(buf, offset, len);
    }
    let base = self
      .pending
      .resolve_base(index, key)
      .ok_or(Errors::KeyNotFound)?;
    match self.pending.subs.get(&entry) {
      None => self.db.get_range(index, &base, offset, len),
      Some(subs) => {
        let committed = self.db.get(index, &base)?;
        let mut value = committed.to_vec();
        for (off, bytes) in subs.iter() {
          overlay(&mut value, *off as usize, bytes);
        }
        slice_window(&value, offset, len)
      }
    }
  }

  /// Total current length of `key`'s value, accounting for pending writes
  /// and the furthest extent reached by pending subsections.
  pub fn value_length(&self, index: u8, key: &[u8]) -> Result<u32> {
    self.check_key(index, key)?;
    let entry = (index, key.to_vec());
    if self.pending.deletes.contains(&entry) {
      return Err(Errors::KeyNotFound);
    }
    let mut len = match self.pending.writes.get(&entry) {
      Some(buf) => buf.len() as u32,
      None => {
        let base = self
          .pending
          .resolve_base(index, key)
          .ok_or(Errors::KeyNotFound)?;
        self.db.value_length(index, &base)?
      }
    };
    if let Some(subs) = self.pending.subs.get(&entry) {
      for (off, bytes) in subs.iter() {
        len = len.max(off + bytes.len() as u32);
      }
    }
    Ok(len)
  }

  /// Applies every buffered operation to the database atomically. On
  /// success the buffer is empty and the transaction may be reused.
  pub fn commit(&mut self) -> Result<()> {
    self.db.commit(&self.pending)?;
    self.pending.clear();
    Ok(())
  }

  /// Discards all buffered state without touching the database.
  pub fn abort(mut self) {
    self.pending.clear();
  }
}

/// Copies `bytes` into `buf` at `offset`, zero-extending as needed.
pub(crate) fn overlay(buf: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
  let end = offset + bytes.len();
  if end > buf.len() {
    buf.resize(end, 0);
  }
  buf[offset..end].copy_from_slice(bytes);
}

fn slice_window(buf: &[u8], offset: u32, len: u32) -> Result<Bytes> {
  let end = offset as u64 + len as u64;
  if end > buf.len() as u64 {
    return Err(Errors::KeyNotFound);
  }
  Ok(Bytes::copy_from_slice(&buf[offset as usize..end as usize]))
}
