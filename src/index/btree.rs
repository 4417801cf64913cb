use std::collections::BTreeSet;

use bytes::{Buf, BufMut, BytesMut};
use log::error;

use crate::{
  data::{FileKind, FileManager, INDEX_HEADER_SIZE},
  errors::{Errors, Result},
  option::IndexOptions,
};

use super::{element_size, node_size, Comparator, DiskLoc, IndexValue, DELETED_SENTINEL, ORDER};

/// A child pointer: either an on-disk location or a resident cached node.
#[derive(Debug, Clone, Copy)]
enum Child {
  Disk(DiskLoc),
  Cached(usize),
}

/// One B-tree node. Cached nodes live in the index's arena and carry a
/// back-link `(parent_slot, child_index)` naming their position under the
/// parent; on disk only the parent-to-child direction exists.
struct Node {
  loc: DiskLoc,
  /// Sorted under the index comparator; may include tombstones.
  elements: Vec<IndexValue>,
  /// Empty for leaves, `elements.len() + 1` entries otherwise.
  children: Vec<Child>,
  parent: Option<(usize, usize)>,
  tick: u64,
  dirty: bool,
  created: bool,
}

impl Node {
  fn is_leaf(&self) -> bool {
    self.children.is_empty()
  }
}

/// Result of a key lookup: the arena node it ended at and either the slot
/// of the matching element or the slot an insert would take.
pub(crate) enum FindResult {
  Found { node: usize, slot: usize },
  Missing { node: usize, slot: usize },
}

/// One persistent, order-64 B-tree index.
///
/// Keys are fixed-length per index and carry their full `IndexValue` at
/// whatever level they live, so a search may terminate before reaching a
/// leaf. The root stays at file 0 offset 6 for the lifetime of the index;
/// a root split pushes both halves into appended nodes. Lower levels are
/// pulled from disk on demand and retained up to `cache_limit` bytes.
pub struct BTreeIndex {
  pub(crate) id: u8,
  pub(crate) key_size: usize,
  cache_limit: usize,
  cached_bytes: usize,
  tick: u64,

  pub(crate) last_file: u16,
  pub(crate) last_size: u32,
  /// Staged tail counters; promoted only after the log truncates.
  pub(crate) new_last_file: u16,
  pub(crate) new_last_size: u32,

  /// Cached-node arena; slot 0 is always the root.
  nodes: Vec<Option<Node>>,
  free_slots: Vec<usize>,

  cmp: Comparator,
  max_file_size: u32,
}

impl BTreeIndex {
  /// Opens the index, creating file 0 with an empty root on first load.
  pub(crate) fn open(
    files: &mut FileManager,
    opts: &IndexOptions,
    cmp: Comparator,
    max_file_size: u32,
  ) -> Result<Self> {
    let ns = node_size(opts.key_size);
    let mut index = BTreeIndex {
      id: opts.id,
      key_size: opts.key_size,
      cache_limit: opts.cache_limit.max(ns),
      cached_bytes: ns,
      tick: 0,
      last_file: 0,
      last_size: 0,
      new_last_file: 0,
      new_last_size: 0,
      nodes: Vec::new(),
      free_slots: Vec::new(),
      cmp,
      max_file_size,
    };

    let file0 = FileKind::Index {
      index: opts.id,
      file: 0,
    };
    let root_loc = DiskLoc {
      file: 0,
      offset: INDEX_HEADER_SIZE,
    };

    if files.exists(file0) {
      let mut header = [0u8; INDEX_HEADER_SIZE as usize];
      files.read(file0, 0, &mut header)?;
      let mut cur = &header[..];
      index.last_file = cur.get_u16_le();
      index.last_size = cur.get_u32_le();

      let mut buf = vec![0u8; ns];
      files.read(file0, INDEX_HEADER_SIZE as u64, &mut buf)?;
      let root = index.decode_node(root_loc, &buf, None)?;
      index.nodes.push(Some(root));
    } else {
      index.last_size = INDEX_HEADER_SIZE + ns as u32;
      index.nodes.push(Some(Node {
        loc: root_loc,
        elements: Vec::new(),
        children: Vec::new(),
        parent: None,
        tick: 0,
        dirty: false,
        created: false,
      }));

      let mut header = BytesMut::with_capacity(INDEX_HEADER_SIZE as usize);
      header.put_u16_le(index.last_file);
      header.put_u32_le(index.last_size);
      files.write(file0, 0, &header)?;
      let root_bytes = index.encode_node(0);
      files.write(file0, INDEX_HEADER_SIZE as u64, &root_bytes)?;
      files.sync(file0)?;
    }

    index.new_last_file = index.last_file;
    index.new_last_size = index.last_size;
    Ok(index)
  }

  pub(crate) fn node_size(&self) -> usize {
    node_size(self.key_size)
  }

  fn node(&self, id: usize) -> &Node {
    self.nodes[id].as_ref().unwrap()
  }

  fn node_mut(&mut self, id: usize) -> &mut Node {
    self.nodes[id].as_mut().unwrap()
  }

  fn touch(&mut self, id: usize) {
    self.tick += 1;
    let tick = self.tick;
    self.node_mut(id).tick = tick;
  }

  fn mark_dirty(&mut self, id: usize) {
    self.node_mut(id).dirty = true;
  }

  fn alloc_slot(&mut self, node: Node) -> usize {
    match self.free_slots.pop() {
      Some(id) => {
        self.nodes[id] = Some(node);
        id
      }
      None => {
        self.nodes.push(Some(node));
        self.nodes.len() - 1
      }
    }
  }

  /// Binary search for `key` inside one node under the index comparator.
  fn search_node(&self, id: usize, key: &[u8]) -> std::result::Result<usize, usize> {
    let node = self.node(id);
    let mut lo = 0;
    let mut hi = node.elements.len();
    while lo < hi {
      let mid = (lo + hi) / 2;
      match (self.cmp)(&node.elements[mid].key, key) {
        std::cmp::Ordering::Less => lo = mid + 1,
        std::cmp::Ordering::Greater => hi = mid,
        std::cmp::Ordering::Equal => return Ok(mid),
      }
    }
    Err(lo)
  }

  /// Descends from the root, loading children on demand.
  pub(crate) fn find(&mut self, files: &mut FileManager, key: &[u8]) -> Result<FindResult> {
    let mut id = 0;
    loop {
      self.touch(id);
      match self.search_node(id, key) {
        Ok(slot) => return Ok(FindResult::Found { node: id, slot }),
        Err(slot) => {
          if self.node(id).is_leaf() {
            return Ok(FindResult::Missing { node: id, slot });
          }
          id = self.load_child(files, id, slot)?;
        }
      }
    }
  }

  /// Returns the live value for `key`, skipping tombstones.
  pub(crate) fn get(&mut self, files: &mut FileManager, key: &[u8]) -> Result<Option<IndexValue>> {
    match self.find(files, key)? {
      FindResult::Found { node, slot } => {
        let element = &self.node(node).elements[slot];
        if element.is_tombstone() {
          Ok(None)
        } else {
          Ok(Some(element.clone()))
        }
      }
      FindResult::Missing { .. } => Ok(None),
    }
  }

  /// Inserts or updates `value`. A key match (tombstoned or live) reuses
  /// the slot in place; otherwise the element is placed at its leaf,
  /// splitting full nodes with median promotion.
  pub(crate) fn insert(&mut self, files: &mut FileManager, value: IndexValue) -> Result<()> {
    match self.find(files, &value.key)? {
      FindResult::Found { node, slot } => {
        {
          let element = &mut self.node_mut(node).elements[slot];
          element.file = value.file;
          element.pos = value.pos;
          element.len = value.len;
        }
        self.mark_dirty(node);
      }
      FindResult::Missing { node, mut slot } => {
        if self.node(node).elements.len() == ORDER && self.node(node).is_leaf() {
          // a leaf about to split sheds its tombstones instead
          self.purge_leaf_tombstones(node);
          slot = match self.search_node(node, &value.key) {
            Err(slot) => slot,
            Ok(_) => return Err(Errors::CorruptedNode),
          };
        }
        self.node_mut(node).elements.insert(slot, value);
        self.mark_dirty(node);
        if self.node(node).elements.len() > ORDER {
          self.split(node)?;
        }
      }
    }
    Ok(())
  }

  /// Tombstones `key`; no structural rebalancing happens at delete time.
  /// Returns whether a live element was erased.
  pub(crate) fn delete(&mut self, files: &mut FileManager, key: &[u8]) -> Result<bool> {
    match self.find(files, key)? {
      FindResult::Found { node, slot } => {
        if self.node(node).elements[slot].is_tombstone() {
          return Ok(false);
        }
        self.node_mut(node).elements[slot].len = DELETED_SENTINEL;
        self.mark_dirty(node);
        Ok(true)
      }
      FindResult::Missing { .. } => Ok(false),
    }
  }

  /// In-order traversal of all live keys, ascending under the comparator.
  pub(crate) fn keys(&mut self, files: &mut FileManager) -> Result<Vec<bytes::Bytes>> {
    let mut out = Vec::new();
    self.collect_keys(files, 0, &mut out)?;
    Ok(out)
  }

  fn collect_keys(
    &mut self,
    files: &mut FileManager,
    id: usize,
    out: &mut Vec<bytes::Bytes>,
  ) -> Result<()> {
    let count = self.node(id).elements.len();
    let internal = !self.node(id).is_leaf();
    for i in 0..count {
      if internal {
        let child = self.load_child(files, id, i)?;
        self.collect_keys(files, child, out)?;
      }
      let element = &self.node(id).elements[i];
      if !element.is_tombstone() {
        out.push(bytes::Bytes::copy_from_slice(&element.key));
      }
    }
    if internal {
      let child = self.load_child(files, id, count)?;
      self.collect_keys(files, child, out)?;
    }
    Ok(())
  }

  fn purge_leaf_tombstones(&mut self, id: usize) {
    let node = self.node_mut(id);
    node.elements.retain(|e| !e.is_tombstone());
    node.dirty = true;
  }

  /// Splits a node holding `ORDER + 1` elements: the median promotes, the
  /// upper half moves to an appended right sibling.
  fn split(&mut self, id: usize) -> Result<()> {
    let mid = self.node(id).elements.len() / 2;
    let (median, right_elems, right_children) = {
      let node = self.node_mut(id);
      let right_elems = node.elements.split_off(mid + 1);
      let median = node.elements.pop().unwrap();
      let right_children = if node.children.is_empty() {
        Vec::new()
      } else {
        node.children.split_off(mid + 1)
      };
      (median, right_elems, right_children)
    };

    let right_loc = self.alloc_node_loc()?;
    let right = Node {
      loc: right_loc,
      elements: right_elems,
      children: right_children,
      parent: None,
      tick: self.tick,
      dirty: true,
      created: true,
    };
    let right_id = self.alloc_slot(right);
    self.cached_bytes += self.node_size();
    self.reparent_children(right_id, 0);

    if id == 0 {
      // the root never moves: both halves drop below it
      let left_loc = self.alloc_node_loc()?;
      let (left_elems, left_children) = {
        let root = self.node_mut(0);
        (
          std::mem::take(&mut root.elements),
          std::mem::take(&mut root.children),
        )
      };
      let left = Node {
        loc: left_loc,
        elements: left_elems,
        children: left_children,
        parent: Some((0, 0)),
        tick: self.tick,
        dirty: true,
        created: true,
      };
      let left_id = self.alloc_slot(left);
      self.cached_bytes += self.node_size();
      self.reparent_children(left_id, 0);

      {
        let root = self.node_mut(0);
        root.elements = vec![median];
        root.children = vec![Child::Cached(left_id), Child::Cached(right_id)];
      }
      self.node_mut(right_id).parent = Some((0, 1));
      self.mark_dirty(0);
    } else {
      let (parent, slot) = self.node(id).parent.unwrap();
      {
        let p = self.node_mut(parent);
        p.elements.insert(slot, median);
        p.children.insert(slot + 1, Child::Cached(right_id));
      }
      self.node_mut(right_id).parent = Some((parent, slot + 1));
      // cached children after the inserted pointer shifted one slot right
      self.reparent_children(parent, slot + 2);
      self.mark_dirty(parent);
      if self.node(parent).elements.len() > ORDER {
        self.split(parent)?;
      }
    }
    Ok(())
  }

  /// Points every cached child at slot `from` or later back at `id`.
  fn reparent_children(&mut self, id: usize, from: usize) {
    let cached: Vec<(usize, usize)> = self
      .node(id)
      .children
      .iter()
      .enumerate()
      .skip(from)
      .filter_map(|(slot, child)| match child {
        Child::Cached(c) => Some((slot, *c)),
        Child::Disk(_) => None,
      })
      .collect();
    for (slot, child) in cached {
      self.node_mut(child).parent = Some((id, slot));
    }
  }

  /// Places a new node at the staged index tail, rolling to a fresh index
  /// file when the current one is full.
  fn alloc_node_loc(&mut self) -> Result<DiskLoc> {
    let ns = self.node_size() as u32;
    if self.new_last_size as u64 + ns as u64 > self.max_file_size as u64 {
      self.new_last_file = match self.new_last_file.checked_add(1) {
        Some(file) => file,
        None => return Err(Errors::NoAvailableFileId),
      };
      self.new_last_size = INDEX_HEADER_SIZE;
    }
    let loc = DiskLoc {
      file: self.new_last_file,
      offset: self.new_last_size,
    };
    self.new_last_size += ns;
    Ok(loc)
  }

  fn load_child(&mut self, files: &mut FileManager, parent: usize, slot: usize) -> Result<usize> {
    let loc = match self.node(parent).children.get(slot) {
      Some(Child::Cached(c)) => return Ok(*c),
      Some(Child::Disk(loc)) => *loc,
      None => {
        error!("index {} descends into an absent child", self.id);
        return Err(Errors::CorruptedNode);
      }
    };

    let mut buf = vec![0u8; self.node_size()];
    files.read(
      FileKind::Index {
        index: self.id,
        file: loc.file,
      },
      loc.offset as u64,
      &mut buf,
    )?;
    let node = self.decode_node(loc, &buf, Some((parent, slot)))?;
    let id = self.alloc_slot(node);
    self.node_mut(parent).children[slot] = Child::Cached(id);
    self.cached_bytes += self.node_size();
    self.touch(id);
    self.evict_over_budget(id);
    Ok(id)
  }

  /// Evicts least-recently-used clean nodes whose children are all on disk
  /// until the cache fits its budget. The root, dirty nodes and the
  /// ancestors of `keep` are never evicted.
  fn evict_over_budget(&mut self, keep: usize) {
    if self.cached_bytes <= self.cache_limit {
      return;
    }
    let mut protected = vec![false; self.nodes.len()];
    let mut cur = Some(keep);
    while let Some(id) = cur {
      protected[id] = true;
      cur = self.node(id).parent.map(|(parent, _)| parent);
    }

    while self.cached_bytes > self.cache_limit {
      let mut victim: Option<(u64, usize)> = None;
      for (id, slot) in self.nodes.iter().enumerate() {
        let Some(node) = slot else { continue };
        if id == 0 || node.dirty || node.created || protected[id] {
          continue;
        }
        if node
          .children
          .iter()
          .any(|c| matches!(c, Child::Cached(_)))
        {
          continue;
        }
        if victim.map_or(true, |(tick, _)| node.tick < tick) {
          victim = Some((node.tick, id));
        }
      }
      match victim {
        Some((_, id)) => self.evict(id),
        None => break,
      }
    }
  }

  fn evict(&mut self, id: usize) {
    let node = self.nodes[id].take().unwrap();
    if let Some((parent, slot)) = node.parent {
      self.node_mut(parent).children[slot] = Child::Disk(node.loc);
    }
    self.cached_bytes -= self.node_size();
    self.free_slots.push(id);
  }

  fn decode_node(&self, loc: DiskLoc, buf: &[u8], parent: Option<(usize, usize)>) -> Result<Node> {
    let es = element_size(self.key_size);
    let count = buf[0] as usize;
    if count > ORDER {
      error!("index {} node at {loc:?} claims {count} elements", self.id);
      return Err(Errors::CorruptedNode);
    }

    let mut elements = Vec::with_capacity(count);
    for i in 0..count {
      let at = 1 + i * es;
      elements.push(IndexValue::decode(self.key_size, &buf[at..at + es]));
    }

    let child_base = 1 + ORDER * es;
    let mut first = &buf[child_base..child_base + 6];
    let leaf = first.get_u16_le() == 0 && first.get_u32_le() == 0;
    let mut children = Vec::new();
    if !leaf {
      for i in 0..=count {
        let at = child_base + i * 6;
        let mut cur = &buf[at..at + 6];
        let file = cur.get_u16_le();
        let offset = cur.get_u32_le();
        if file == 0 && offset == 0 {
          error!("index {} node at {loc:?} has a zero child pointer", self.id);
          return Err(Errors::CorruptedNode);
        }
        children.push(Child::Disk(DiskLoc { file, offset }));
      }
    }

    Ok(Node {
      loc,
      elements,
      children,
      parent,
      tick: self.tick,
      dirty: false,
      created: false,
    })
  }

  pub(crate) fn encode_node(&self, id: usize) -> Vec<u8> {
    let node = self.node(id);
    let es = element_size(self.key_size);
    let mut buf = BytesMut::with_capacity(self.node_size());
    buf.put_u8(node.elements.len() as u8);
    for element in node.elements.iter() {
      element.encode_into(&mut buf);
    }
    buf.put_bytes(0, (ORDER - node.elements.len()) * es);
    for i in 0..=ORDER {
      match node.children.get(i) {
        Some(Child::Disk(loc)) => {
          buf.put_u16_le(loc.file);
          buf.put_u32_le(loc.offset);
        }
        Some(Child::Cached(c)) => {
          let loc = self.node(*c).loc;
          buf.put_u16_le(loc.file);
          buf.put_u32_le(loc.offset);
        }
        None => buf.put_bytes(0, 6),
      }
    }
    buf.to_vec()
  }

  // ---- commit support ----

  /// Resets the staged tail counters at the start of a commit.
  pub(crate) fn begin_commit(&mut self) {
    self.new_last_file = self.last_file;
    self.new_last_size = self.last_size;
  }

  /// Locations of mutated pre-existing nodes, whose on-disk bytes become
  /// write-ahead before-images. Created nodes are appends and need none.
  pub(crate) fn dirty_locs(&self) -> Vec<DiskLoc> {
    self
      .nodes
      .iter()
      .flatten()
      .filter(|n| n.dirty && !n.created)
      .map(|n| n.loc)
      .collect()
  }

  /// Writes every dirty or created node back to its index file.
  pub(crate) fn write_back(&mut self, files: &mut FileManager) -> Result<()> {
    let ids: Vec<usize> = self
      .nodes
      .iter()
      .enumerate()
      .filter(|(_, slot)| {
        slot
          .as_ref()
          .map_or(false, |n| n.dirty || n.created)
      })
      .map(|(id, _)| id)
      .collect();
    for id in ids {
      let bytes = self.encode_node(id);
      let loc = self.node(id).loc;
      files.write(
        FileKind::Index {
          index: self.id,
          file: loc.file,
        },
        loc.offset as u64,
        &bytes,
      )?;
    }
    Ok(())
  }

  /// Index files touched by the running commit, for the sync pass.
  pub(crate) fn touched_files(&self) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    out.insert(0);
    for node in self.nodes.iter().flatten() {
      if node.dirty || node.created {
        out.insert(node.loc.file);
      }
    }
    out
  }

  /// Moves the staged tail counters into place and rewrites the header.
  pub(crate) fn promote(&mut self, files: &mut FileManager) -> Result<()> {
    self.last_file = self.new_last_file;
    self.last_size = self.new_last_size;
    let mut header = BytesMut::with_capacity(INDEX_HEADER_SIZE as usize);
    header.put_u16_le(self.last_file);
    header.put_u32_le(self.last_size);
    files.write(
      FileKind::Index {
        index: self.id,
        file: 0,
      },
      0,
      &header,
    )
  }

  /// Clears per-commit node state once the log has truncated.
  pub(crate) fn end_commit(&mut self) {
    for node in self.nodes.iter_mut().flatten() {
      node.dirty = false;
      node.created = false;
    }
  }

  #[cfg(test)]
  fn root_shape(&self) -> (usize, usize) {
    let root = self.node(0);
    (root.elements.len(), root.children.len())
  }

  #[cfg(test)]
  fn child_element_count(&self, slot: usize) -> usize {
    match self.node(0).children[slot] {
      Child::Cached(c) => self.node(c).elements.len(),
      Child::Disk(_) => 0,
    }
  }
}
