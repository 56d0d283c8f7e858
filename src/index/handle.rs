//! # Index Handle
//!
//! One open B+ tree file. The handle owns the immutable
//! [`IndexSchema`](super::IndexSchema) and a mutex around the mutable
//! header fields (root, leaf anchors, page count); that mutex doubles as
//! the tree-wide latch every operation holds for its full duration.
//!
//! Node pages are pinned one at a time on the way down (the parent is
//! unpinned before descending), and structural operations pin at most
//! three pages at once (node, parent, sibling).

use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::node::{Node, NodeInsert, NodeMut};
use super::scan::IndexScan;
use super::{Iid, IndexCol, IndexSchema, FILE_HEADER_PAGE, LEAF_HEADER_PAGE};
use crate::errors::{DbError, Result};
use crate::storage::{BufferPool, DiskManager, FileId, PageGuard, PAGE_SIZE};
use crate::types::{ColType, Rid, NO_PAGE};

/// Scratch buffer for one key; spills to the heap only for wide
/// composite keys.
type KeyBuf = SmallVec<[u8; 32]>;

/// Mutable header fields, guarded by the tree-wide latch.
struct TreeState {
    root_page: i32,
    first_leaf: i32,
    last_leaf: i32,
    num_pages: i32,
}

pub struct IndexHandle {
    fd: FileId,
    name: String,
    schema: IndexSchema,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    state: Mutex<TreeState>,
}

impl IndexHandle {
    /// Creates a new index file: header page, leaf-list sentinel, and an
    /// empty root leaf wired into the chain.
    pub fn create<P: AsRef<Path>>(disk: &DiskManager, path: P, cols: &[IndexCol]) -> Result<()> {
        let schema = IndexSchema::new(cols)?;
        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;

        let root_page = LEAF_HEADER_PAGE + 1;
        for _ in 0..3 {
            disk.allocate_page_no(fd)?;
        }

        let state = TreeState {
            root_page,
            first_leaf: root_page,
            last_leaf: root_page,
            num_pages: 3,
        };
        let mut page = [0u8; PAGE_SIZE];
        serialize_header(&mut page, &schema, &state);
        disk.write_page(fd, FILE_HEADER_PAGE, &page)?;

        let mut page = [0u8; PAGE_SIZE];
        {
            let mut sentinel = NodeMut::new(&mut page, &schema)?;
            sentinel.init(true, NO_PAGE);
            sentinel.set_prev_leaf(root_page);
            sentinel.set_next_leaf(root_page);
        }
        disk.write_page(fd, LEAF_HEADER_PAGE, &page)?;

        let mut page = [0u8; PAGE_SIZE];
        {
            let mut root = NodeMut::new(&mut page, &schema)?;
            root.init(true, NO_PAGE);
            root.set_prev_leaf(LEAF_HEADER_PAGE);
            root.set_next_leaf(LEAF_HEADER_PAGE);
        }
        disk.write_page(fd, root_page, &page)?;

        disk.close_file(fd)?;
        debug!(
            "created index '{}' (key_size={}, max_keys={})",
            path.as_ref().display(),
            schema.key_size(),
            schema.max_keys()
        );
        Ok(())
    }

    /// Opens an existing index file.
    pub fn open<P: AsRef<Path>>(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        path: P,
    ) -> Result<IndexHandle> {
        let fd = disk.open_file(&path)?;
        let mut page = [0u8; PAGE_SIZE];
        disk.read_page(fd, FILE_HEADER_PAGE, &mut page)?;
        let (state, schema) = deserialize_header(&page)?;
        // The page-number allocator stays seeded from the physical file
        // size: the in-header count excludes pages abandoned by
        // coalescing, and those numbers must not be reissued.
        Ok(IndexHandle {
            fd,
            name: path.as_ref().display().to_string(),
            schema,
            disk,
            pool,
            state: Mutex::new(state),
        })
    }

    /// Removes the file from disk. It must be closed.
    pub fn destroy<P: AsRef<Path>>(disk: &DiskManager, path: P) -> Result<()> {
        disk.destroy_file(path)
    }

    /// Writes the header and every dirty node back to disk.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let mut page = [0u8; PAGE_SIZE];
        serialize_header(&mut page, &self.schema, &state);
        self.disk.write_page(self.fd, FILE_HEADER_PAGE, &page)?;
        self.pool.flush_file(self.fd)?;
        Ok(())
    }

    /// Flushes and closes the file. Further operations on this handle
    /// fail with an unknown-descriptor error.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.pool.evict_file_pages(self.fd)?;
        self.disk.close_file(self.fd)
    }

    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn num_pages(&self) -> i32 {
        self.state.lock().num_pages
    }

    /// Point lookup: the rid stored under `key`, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Rid>> {
        self.check_key(key)?;
        let state = self.state.lock();
        if state.root_page == NO_PAGE {
            return Ok(None);
        }
        let guard = self.find_leaf(&state, key)?;
        let node = Node::new(guard.data(), &self.schema)?;
        Ok(node.leaf_lookup(key))
    }

    /// Inserts `(key, rid)`. Returns `false` when the key is already
    /// present (no replacement happens).
    pub fn insert(&self, key: &[u8], rid: Rid) -> Result<bool> {
        self.check_key(key)?;
        let mut state = self.state.lock();
        if state.root_page == NO_PAGE {
            self.create_root_leaf(&mut state)?;
        }

        let mut guard = self.find_leaf(&state, key)?;
        let leaf_page = guard.page_no();
        let (pos, num_key) = {
            let mut node = NodeMut::new(guard.data_mut(), &self.schema)?;
            match node.insert(key, rid) {
                NodeInsert::Duplicate => return Ok(false),
                NodeInsert::Inserted { pos, num_key } => (pos, num_key),
            }
        };
        drop(guard);

        if pos == 0 {
            // The leaf minimum changed; push it up the separator chain.
            self.maintain_parent(leaf_page)?;
        }
        if num_key == self.schema.max_keys() {
            self.split_and_propagate(leaf_page, &mut state)?;
        }
        Ok(true)
    }

    /// Deletes `key`. Returns `false` when it is absent.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let mut state = self.state.lock();
        if state.root_page == NO_PAGE {
            return Ok(false);
        }

        let mut guard = self.find_leaf(&state, key)?;
        let leaf_page = guard.page_no();
        let (pos, num_key) = {
            let mut node = NodeMut::new(guard.data_mut(), &self.schema)?;
            match node.remove(key) {
                None => return Ok(false),
                Some(pos) => (pos, node.reader().num_key()),
            }
        };
        drop(guard);

        if num_key > 0 && pos == 0 {
            self.maintain_parent(leaf_page)?;
        }
        self.coalesce_or_redistribute(leaf_page, &mut state)?;
        Ok(true)
    }

    /// Position of the first entry with key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let state = self.state.lock();
        self.bound(&state, key, false)
    }

    /// Position of the first entry with key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let state = self.state.lock();
        self.bound(&state, key, true)
    }

    /// Position of the first entry in key order.
    pub fn leaf_begin(&self) -> Iid {
        let state = self.state.lock();
        Iid::new(state.first_leaf, 0)
    }

    /// One past the last entry in key order.
    pub fn leaf_end(&self) -> Result<Iid> {
        let state = self.state.lock();
        if state.root_page == NO_PAGE {
            return Ok(Iid::new(LEAF_HEADER_PAGE, 0));
        }
        let guard = self.pool.fetch_page(self.fd, state.last_leaf)?;
        let num = Node::new(guard.data(), &self.schema)?.num_key();
        Ok(Iid::new(state.last_leaf, num as i32))
    }

    /// Cursor over the whole index in key order.
    pub fn scan(&self) -> Result<IndexScan<'_>> {
        Ok(IndexScan::new(self, self.leaf_begin(), self.leaf_end()?))
    }

    /// Cursor over `[lower, upper)` in key order; `None` bounds are
    /// unbounded.
    pub fn range_scan(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<IndexScan<'_>> {
        let begin = match lower {
            Some(key) => self.lower_bound(key)?,
            None => self.leaf_begin(),
        };
        let end = match upper {
            Some(key) => self.lower_bound(key)?,
            None => self.leaf_end()?,
        };
        Ok(IndexScan::new(self, begin, end))
    }

    /// Rid stored at an index position.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        if iid.page_no == LEAF_HEADER_PAGE {
            return Err(DbError::IndexEntryNotFound);
        }
        let guard = self.pool.fetch_page(self.fd, iid.page_no)?;
        let node = Node::new(guard.data(), &self.schema)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.num_key() {
            return Err(DbError::IndexEntryNotFound);
        }
        Ok(node.rid_at(iid.slot_no as usize))
    }

    /// Key stored at an index position.
    pub fn get_key(&self, iid: Iid) -> Result<Vec<u8>> {
        if iid.page_no == LEAF_HEADER_PAGE {
            return Err(DbError::IndexEntryNotFound);
        }
        let guard = self.pool.fetch_page(self.fd, iid.page_no)?;
        let node = Node::new(guard.data(), &self.schema)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.num_key() {
            return Err(DbError::IndexEntryNotFound);
        }
        Ok(node.key_at(iid.slot_no as usize).to_vec())
    }

    pub(crate) fn fetch_node(&self, page_no: i32) -> Result<PageGuard<'_>> {
        self.pool.fetch_page(self.fd, page_no)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.schema.key_size() {
            return Err(DbError::internal(format!(
                "key length {} does not match key size {} of index '{}'",
                key.len(),
                self.schema.key_size(),
                self.name
            )));
        }
        Ok(())
    }

    /// Descends from the root to the leaf whose range covers `key`,
    /// unpinning each parent before stepping into its child.
    fn find_leaf(&self, state: &TreeState, key: &[u8]) -> Result<PageGuard<'_>> {
        let mut guard = self.pool.fetch_page(self.fd, state.root_page)?;
        loop {
            let child = {
                let node = Node::new(guard.data(), &self.schema)?;
                if node.is_leaf() {
                    return Ok(guard);
                }
                node.internal_lookup(key)
            };
            guard = self.pool.fetch_page(self.fd, child)?;
        }
    }

    fn bound(&self, state: &TreeState, key: &[u8], strict: bool) -> Result<Iid> {
        if state.root_page == NO_PAGE {
            return Ok(Iid::new(LEAF_HEADER_PAGE, 0));
        }
        let mut guard = self.find_leaf(state, key)?;
        let mut pos = {
            let node = Node::new(guard.data(), &self.schema)?;
            let mut pos = node.lower_bound(key);
            if strict
                && pos < node.num_key()
                && self.schema.compare(node.key_at(pos), key) == std::cmp::Ordering::Equal
            {
                // Keys are unique, so "first greater" is at most one
                // slot past "first not less".
                pos += 1;
            }
            pos
        };
        loop {
            let (num_key, next_leaf) = {
                let node = Node::new(guard.data(), &self.schema)?;
                (node.num_key(), node.next_leaf())
            };
            if pos < num_key || next_leaf == LEAF_HEADER_PAGE {
                return Ok(Iid::new(guard.page_no(), pos as i32));
            }
            guard = self.pool.fetch_page(self.fd, next_leaf)?;
            pos = 0;
        }
    }

    /// Re-creates an empty root leaf after the tree was deleted down to
    /// nothing.
    fn create_root_leaf(&self, state: &mut TreeState) -> Result<()> {
        let mut guard = self.pool.new_page(self.fd)?;
        let page_no = guard.page_no();
        {
            let mut node = NodeMut::new(guard.data_mut(), &self.schema)?;
            node.init(true, NO_PAGE);
            node.set_prev_leaf(LEAF_HEADER_PAGE);
            node.set_next_leaf(LEAF_HEADER_PAGE);
        }
        drop(guard);
        let mut sentinel = self.pool.fetch_page(self.fd, LEAF_HEADER_PAGE)?;
        {
            let mut node = NodeMut::new(sentinel.data_mut(), &self.schema)?;
            node.set_prev_leaf(page_no);
            node.set_next_leaf(page_no);
        }
        state.root_page = page_no;
        state.first_leaf = page_no;
        state.last_leaf = page_no;
        state.num_pages += 1;
        Ok(())
    }

    /// Walks from `curr_page` toward the root, overwriting each parent
    /// separator that still holds the child's old minimum. Stops at the
    /// first separator that already matches.
    fn maintain_parent(&self, mut curr_page: i32) -> Result<()> {
        loop {
            let (parent_page, first_key): (i32, KeyBuf) = {
                let guard = self.pool.fetch_page(self.fd, curr_page)?;
                let node = Node::new(guard.data(), &self.schema)?;
                (node.parent(), SmallVec::from_slice(node.key_at(0)))
            };
            if parent_page == NO_PAGE {
                return Ok(());
            }
            let mut guard = self.pool.fetch_page(self.fd, parent_page)?;
            let rank = {
                let node = Node::new(guard.data(), &self.schema)?;
                let rank = node.find_child_index(curr_page).ok_or_else(|| {
                    DbError::internal(format!(
                        "node {curr_page} missing from its parent {parent_page} in '{}'",
                        self.name
                    ))
                })?;
                if node.key_at(rank) == first_key.as_slice() {
                    return Ok(());
                }
                rank
            };
            let mut node = NodeMut::new(guard.data_mut(), &self.schema)?;
            node.set_key(rank, &first_key);
            curr_page = parent_page;
        }
    }

    /// Splits `page_no` into itself plus a new right sibling, moving the
    /// upper half of its entries. Returns the sibling's page number and
    /// first key.
    fn split_node(&self, page_no: i32, state: &mut TreeState) -> Result<(i32, KeyBuf)> {
        let mut new_guard = self.pool.new_page(self.fd)?;
        let new_page = new_guard.page_no();
        state.num_pages += 1;

        let mut old_guard = self.pool.fetch_page(self.fd, page_no)?;
        let (is_leaf, parent, num_key, next_leaf) = {
            let node = Node::new(old_guard.data(), &self.schema)?;
            (
                node.is_leaf(),
                node.parent(),
                node.num_key(),
                node.next_leaf(),
            )
        };
        let split = num_key / 2;
        let moved = num_key - split;

        {
            let old_node = Node::new(old_guard.data(), &self.schema)?;
            let mut new_node = NodeMut::new(new_guard.data_mut(), &self.schema)?;
            new_node.init(is_leaf, parent);
            new_node.insert_pairs(
                0,
                old_node.keys_raw(split, moved),
                old_node.rids_raw(split, moved),
                moved,
            );
        }
        {
            let mut old_node = NodeMut::new(old_guard.data_mut(), &self.schema)?;
            old_node.set_num_key(split);
        }

        if is_leaf {
            {
                let mut new_node = NodeMut::new(new_guard.data_mut(), &self.schema)?;
                new_node.set_prev_leaf(page_no);
                new_node.set_next_leaf(next_leaf);
            }
            {
                let mut old_node = NodeMut::new(old_guard.data_mut(), &self.schema)?;
                old_node.set_next_leaf(new_page);
            }
            {
                let mut succ = self.pool.fetch_page(self.fd, next_leaf)?;
                let mut succ_node = NodeMut::new(succ.data_mut(), &self.schema)?;
                succ_node.set_prev_leaf(new_page);
            }
            if state.last_leaf == page_no {
                state.last_leaf = new_page;
            }
        } else {
            drop(old_guard);
            for i in 0..moved {
                let child = {
                    let node = Node::new(new_guard.data(), &self.schema)?;
                    node.child_at(i)
                };
                self.reparent(child, new_page)?;
            }
        }

        let first_key = {
            let node = Node::new(new_guard.data(), &self.schema)?;
            SmallVec::from_slice(node.key_at(0))
        };
        Ok((new_page, first_key))
    }

    /// Splits `page_no` and inserts the resulting separator into its
    /// parent, recursing while parents fill up to capacity.
    fn split_and_propagate(&self, page_no: i32, state: &mut TreeState) -> Result<()> {
        let mut curr = page_no;
        loop {
            let (new_page, first_key) = self.split_node(curr, state)?;

            if curr == state.root_page {
                return self.grow_new_root(curr, new_page, &first_key, state);
            }

            let parent_page = {
                let guard = self.pool.fetch_page(self.fd, curr)?;
                Node::new(guard.data(), &self.schema)?.parent()
            };
            let parent_num = {
                let mut guard = self.pool.fetch_page(self.fd, parent_page)?;
                let mut node = NodeMut::new(guard.data_mut(), &self.schema)?;
                let idx = node.reader().find_child_index(curr).ok_or_else(|| {
                    DbError::internal(format!(
                        "node {curr} missing from its parent {parent_page} in '{}'",
                        self.name
                    ))
                })?;
                node.insert_pairs(idx + 1, &first_key, &Rid::new(new_page, 0).to_bytes(), 1);
                node.reader().num_key()
            };
            self.reparent(new_page, parent_page)?;

            if parent_num < self.schema.max_keys() {
                return Ok(());
            }
            curr = parent_page;
        }
    }

    /// Publishes a fresh internal root over `left` and `right` after a
    /// root split.
    fn grow_new_root(
        &self,
        left: i32,
        right: i32,
        right_first_key: &[u8],
        state: &mut TreeState,
    ) -> Result<()> {
        let left_first_key: KeyBuf = {
            let guard = self.pool.fetch_page(self.fd, left)?;
            let node = Node::new(guard.data(), &self.schema)?;
            SmallVec::from_slice(node.key_at(0))
        };

        let mut root_guard = self.pool.new_page(self.fd)?;
        let root_page = root_guard.page_no();
        state.num_pages += 1;
        {
            let mut node = NodeMut::new(root_guard.data_mut(), &self.schema)?;
            node.init(false, NO_PAGE);
            node.insert_pairs(0, &left_first_key, &Rid::new(left, 0).to_bytes(), 1);
            node.insert_pairs(1, right_first_key, &Rid::new(right, 0).to_bytes(), 1);
        }
        drop(root_guard);

        self.reparent(left, root_page)?;
        self.reparent(right, root_page)?;
        state.root_page = root_page;
        debug!("index '{}' grew a new root at page {root_page}", self.name);
        Ok(())
    }

    fn reparent(&self, child_page: i32, parent_page: i32) -> Result<()> {
        let mut guard = self.pool.fetch_page(self.fd, child_page)?;
        let mut node = NodeMut::new(guard.data_mut(), &self.schema)?;
        node.set_parent(parent_page);
        Ok(())
    }

    /// Restores the minimum-fill invariant at `page_no` after a delete,
    /// recursing up through the parent when nodes merge.
    fn coalesce_or_redistribute(&self, page_no: i32, state: &mut TreeState) -> Result<()> {
        if page_no == state.root_page {
            return self.adjust_root(state);
        }

        let (num_key, parent_page) = {
            let guard = self.pool.fetch_page(self.fd, page_no)?;
            let node = Node::new(guard.data(), &self.schema)?;
            (node.num_key(), node.parent())
        };
        if num_key >= self.schema.min_keys() {
            return Ok(());
        }

        let (idx, sibling_page) = {
            let guard = self.pool.fetch_page(self.fd, parent_page)?;
            let node = Node::new(guard.data(), &self.schema)?;
            let idx = node.find_child_index(page_no).ok_or_else(|| {
                DbError::internal(format!(
                    "node {page_no} missing from its parent {parent_page} in '{}'",
                    self.name
                ))
            })?;
            // Prefer the left sibling; only the leftmost child pairs to
            // its right.
            let sibling_idx = if idx > 0 { idx - 1 } else { idx + 1 };
            (idx, node.child_at(sibling_idx))
        };

        let sibling_num = {
            let guard = self.pool.fetch_page(self.fd, sibling_page)?;
            Node::new(guard.data(), &self.schema)?.num_key()
        };

        if num_key + sibling_num >= 2 * self.schema.min_keys() {
            self.redistribute(sibling_page, page_no, parent_page, idx)
        } else {
            let (left, right, right_idx) = if idx == 0 {
                (page_no, sibling_page, idx + 1)
            } else {
                (sibling_page, page_no, idx)
            };
            self.coalesce(left, right, parent_page, right_idx, state)?;
            self.coalesce_or_redistribute(parent_page, state)
        }
    }

    /// Moves exactly one entry from `sibling_page` into `node_page`
    /// (`idx` is the node's position under their shared parent) and
    /// refreshes the parent separator of whichever node's minimum moved.
    fn redistribute(
        &self,
        sibling_page: i32,
        node_page: i32,
        parent_page: i32,
        idx: usize,
    ) -> Result<()> {
        let mut node_guard = self.pool.fetch_page(self.fd, node_page)?;
        let mut sibling_guard = self.pool.fetch_page(self.fd, sibling_page)?;
        let mut parent_guard = self.pool.fetch_page(self.fd, parent_page)?;

        let is_leaf = Node::new(node_guard.data(), &self.schema)?.is_leaf();

        if idx == 0 {
            // Sibling is on the right: its first entry becomes the
            // node's last.
            let (moved_key, moved_rid, sibling_new_first): (KeyBuf, Rid, KeyBuf) = {
                let sibling = Node::new(sibling_guard.data(), &self.schema)?;
                (
                    SmallVec::from_slice(sibling.key_at(0)),
                    sibling.rid_at(0),
                    SmallVec::from_slice(sibling.key_at(1)),
                )
            };
            {
                let mut node = NodeMut::new(node_guard.data_mut(), &self.schema)?;
                let num = node.reader().num_key();
                node.insert_pairs(num, &moved_key, &moved_rid.to_bytes(), 1);
            }
            {
                let mut sibling = NodeMut::new(sibling_guard.data_mut(), &self.schema)?;
                sibling.erase_pair(0);
            }
            {
                let mut parent = NodeMut::new(parent_guard.data_mut(), &self.schema)?;
                parent.set_key(idx + 1, &sibling_new_first);
            }
            if !is_leaf {
                drop(node_guard);
                self.reparent(moved_rid.page_no, node_page)?;
            }
        } else {
            // Sibling is on the left: its last entry becomes the node's
            // first.
            let (moved_key, moved_rid): (KeyBuf, Rid) = {
                let sibling = Node::new(sibling_guard.data(), &self.schema)?;
                let last = sibling.num_key() - 1;
                (SmallVec::from_slice(sibling.key_at(last)), sibling.rid_at(last))
            };
            {
                let mut node = NodeMut::new(node_guard.data_mut(), &self.schema)?;
                node.insert_pairs(0, &moved_key, &moved_rid.to_bytes(), 1);
            }
            {
                let mut sibling = NodeMut::new(sibling_guard.data_mut(), &self.schema)?;
                let last = sibling.reader().num_key() - 1;
                sibling.erase_pair(last);
            }
            {
                let mut parent = NodeMut::new(parent_guard.data_mut(), &self.schema)?;
                parent.set_key(idx, &moved_key);
            }
            if !is_leaf {
                drop(node_guard);
                self.reparent(moved_rid.page_no, node_page)?;
            }
        }
        Ok(())
    }

    /// Merges `right` into `left` (children of the same parent, adjacent,
    /// `right_idx` is right's position in the parent), drops the parent
    /// separator, and abandons the right page.
    fn coalesce(
        &self,
        left: i32,
        right: i32,
        parent_page: i32,
        right_idx: usize,
        state: &mut TreeState,
    ) -> Result<()> {
        let mut left_guard = self.pool.fetch_page(self.fd, left)?;
        let right_guard = self.pool.fetch_page(self.fd, right)?;

        let (is_leaf, right_num, right_next) = {
            let node = Node::new(right_guard.data(), &self.schema)?;
            (node.is_leaf(), node.num_key(), node.next_leaf())
        };
        let left_num = {
            let right_node = Node::new(right_guard.data(), &self.schema)?;
            let mut left_node = NodeMut::new(left_guard.data_mut(), &self.schema)?;
            let left_num = left_node.reader().num_key();
            left_node.insert_pairs(
                left_num,
                right_node.keys_raw(0, right_num),
                right_node.rids_raw(0, right_num),
                right_num,
            );
            if is_leaf {
                left_node.set_next_leaf(right_next);
            }
            left_num
        };
        drop(right_guard);

        if is_leaf {
            {
                let mut succ = self.pool.fetch_page(self.fd, right_next)?;
                let mut succ_node = NodeMut::new(succ.data_mut(), &self.schema)?;
                succ_node.set_prev_leaf(left);
            }
            if state.last_leaf == right {
                state.last_leaf = left;
            }
        } else {
            drop(left_guard);
            for i in 0..right_num {
                let child = {
                    let guard = self.pool.fetch_page(self.fd, left)?;
                    Node::new(guard.data(), &self.schema)?.child_at(left_num + i)
                };
                self.reparent(child, left)?;
            }
        }

        {
            let mut parent_guard = self.pool.fetch_page(self.fd, parent_page)?;
            let mut parent = NodeMut::new(parent_guard.data_mut(), &self.schema)?;
            parent.erase_pair(right_idx);
        }

        // Allocate-only page policy: the page number is abandoned to the
        // cache, never chained into a free list.
        state.num_pages -= 1;
        Ok(())
    }

    /// Root-specific rebalancing: promote a single-child internal root,
    /// or collapse an emptied leaf root to the NO_PAGE sentinel.
    fn adjust_root(&self, state: &mut TreeState) -> Result<()> {
        let root = state.root_page;
        let (is_leaf, num_key) = {
            let guard = self.pool.fetch_page(self.fd, root)?;
            let node = Node::new(guard.data(), &self.schema)?;
            (node.is_leaf(), node.num_key())
        };

        if !is_leaf && num_key == 1 {
            let child = {
                let guard = self.pool.fetch_page(self.fd, root)?;
                Node::new(guard.data(), &self.schema)?.child_at(0)
            };
            self.reparent(child, NO_PAGE)?;
            state.root_page = child;
            state.num_pages -= 1;
            debug!("index '{}' root collapsed to page {child}", self.name);
        } else if is_leaf && num_key == 0 {
            let mut sentinel = self.pool.fetch_page(self.fd, LEAF_HEADER_PAGE)?;
            {
                let mut node = NodeMut::new(sentinel.data_mut(), &self.schema)?;
                node.set_prev_leaf(LEAF_HEADER_PAGE);
                node.set_next_leaf(LEAF_HEADER_PAGE);
            }
            state.root_page = NO_PAGE;
            state.first_leaf = LEAF_HEADER_PAGE;
            state.last_leaf = LEAF_HEADER_PAGE;
            state.num_pages -= 1;
            debug!("index '{}' is now empty", self.name);
        }
        Ok(())
    }

    /// Verifies the structural invariants of the whole tree: key order,
    /// fill factors, separator/minimum agreement, parent pointers,
    /// uniform leaf depth, and the leaf chain. Intended for tests and
    /// debugging; walks every node.
    pub fn validate(&self) -> Result<()> {
        let state = self.state.lock();
        if state.root_page == NO_PAGE {
            if state.first_leaf != LEAF_HEADER_PAGE || state.last_leaf != LEAF_HEADER_PAGE {
                return Err(DbError::internal(format!(
                    "empty index '{}' has dangling leaf anchors",
                    self.name
                )));
            }
            return Ok(());
        }

        let mut leaves = Vec::new();
        self.validate_node(state.root_page, NO_PAGE, &state, &mut leaves, 0)?;

        // The chain must visit exactly the leaves found by traversal, in
        // order, and close back at the sentinel.
        let mut chained = Vec::new();
        let mut prev = LEAF_HEADER_PAGE;
        let mut curr = state.first_leaf;
        while curr != LEAF_HEADER_PAGE {
            let guard = self.pool.fetch_page(self.fd, curr)?;
            let node = Node::new(guard.data(), &self.schema)?;
            if node.prev_leaf() != prev {
                return Err(DbError::internal(format!(
                    "leaf {curr} prev pointer {} should be {prev} in '{}'",
                    node.prev_leaf(),
                    self.name
                )));
            }
            chained.push(curr);
            prev = curr;
            curr = node.next_leaf();
            if chained.len() > leaves.len() {
                return Err(DbError::internal(format!(
                    "leaf chain of '{}' does not terminate",
                    self.name
                )));
            }
        }
        if chained != leaves {
            return Err(DbError::internal(format!(
                "leaf chain of '{}' disagrees with tree traversal",
                self.name
            )));
        }
        if state.last_leaf != *leaves.last().unwrap_or(&LEAF_HEADER_PAGE) {
            return Err(DbError::internal(format!(
                "last_leaf of '{}' is stale",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns (min_key, leaf_depth) of the subtree at `page_no`.
    fn validate_node(
        &self,
        page_no: i32,
        expected_parent: i32,
        state: &TreeState,
        leaves: &mut Vec<i32>,
        depth: usize,
    ) -> Result<(Vec<u8>, usize)> {
        let guard = self.pool.fetch_page(self.fd, page_no)?;
        let node = Node::new(guard.data(), &self.schema)?;
        let num = node.num_key();
        let is_root = page_no == state.root_page;

        if node.parent() != expected_parent {
            return Err(DbError::internal(format!(
                "node {page_no} parent {} should be {expected_parent} in '{}'",
                node.parent(),
                self.name
            )));
        }
        // A leaf root may be empty (fresh index); nothing else may.
        if (num == 0 && !(is_root && node.is_leaf())) || num >= self.schema.max_keys() {
            return Err(DbError::internal(format!(
                "node {page_no} holds {num} keys in '{}'",
                self.name
            )));
        }
        if !is_root && num < self.schema.min_keys() {
            return Err(DbError::internal(format!(
                "node {page_no} underflows with {num} keys in '{}'",
                self.name
            )));
        }
        for i in 1..num {
            if self.schema.compare(node.key_at(i - 1), node.key_at(i))
                != std::cmp::Ordering::Less
            {
                return Err(DbError::internal(format!(
                    "node {page_no} keys not strictly ascending in '{}'",
                    self.name
                )));
            }
        }

        if node.is_leaf() {
            leaves.push(page_no);
            let min_key = if num > 0 {
                node.key_at(0).to_vec()
            } else {
                Vec::new()
            };
            return Ok((min_key, depth));
        }

        let keys: Vec<Vec<u8>> = (0..num).map(|i| node.key_at(i).to_vec()).collect();
        let children: Vec<i32> = (0..num).map(|i| node.child_at(i)).collect();
        drop(guard);

        let mut leaf_depth = None;
        for (i, &child) in children.iter().enumerate() {
            let (child_min, child_depth) =
                self.validate_node(child, page_no, state, leaves, depth + 1)?;
            if child_min != keys[i] {
                return Err(DbError::internal(format!(
                    "separator {i} of node {page_no} disagrees with child minimum in '{}'",
                    self.name
                )));
            }
            match leaf_depth {
                None => leaf_depth = Some(child_depth),
                Some(d) if d != child_depth => {
                    return Err(DbError::internal(format!(
                        "uneven leaf depth under node {page_no} in '{}'",
                        self.name
                    )));
                }
                _ => {}
            }
        }
        Ok((keys[0].clone(), leaf_depth.unwrap_or(depth)))
    }
}

fn serialize_header(buf: &mut [u8], schema: &IndexSchema, state: &TreeState) {
    let mut w = |offset: usize, v: i32| buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    w(0, state.num_pages);
    w(4, state.root_page);
    w(8, state.first_leaf);
    w(12, state.last_leaf);
    w(16, schema.key_size() as i32);
    w(20, schema.cols().len() as i32);
    for (i, col) in schema.cols().iter().enumerate() {
        w(24 + i * 8, col.col_type.code() as i32);
        w(28 + i * 8, col.len as i32);
    }
}

fn deserialize_header(buf: &[u8]) -> Result<(TreeState, IndexSchema)> {
    let r = |offset: usize| {
        i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
    };
    let num_pages = r(0);
    let root_page = r(4);
    let first_leaf = r(8);
    let last_leaf = r(12);
    let key_size = r(16);
    let col_count = r(20);
    if col_count <= 0 || col_count as usize > (PAGE_SIZE - 24) / 8 {
        return Err(DbError::internal("not an index file"));
    }
    let mut cols = Vec::with_capacity(col_count as usize);
    for i in 0..col_count as usize {
        cols.push(IndexCol {
            col_type: ColType::from_code(r(24 + i * 8) as u32)?,
            len: r(28 + i * 8) as usize,
        });
    }
    let schema = IndexSchema::new(&cols)?;
    if schema.key_size() != key_size as usize {
        return Err(DbError::internal(format!(
            "index header key size {key_size} disagrees with column widths"
        )));
    }
    Ok((
        TreeState {
            root_page,
            first_leaf,
            last_leaf,
            num_pages,
        },
        schema,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn int_cols() -> Vec<IndexCol> {
        vec![IndexCol {
            col_type: ColType::Int,
            len: 4,
        }]
    }

    fn key(v: i32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn open_index() -> (tempfile::TempDir, IndexHandle) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let disk = Arc::new(DiskManager::new());
        let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 256).unwrap());
        IndexHandle::create(&disk, &path, &int_cols()).unwrap();
        let index = IndexHandle::open(disk, pool, &path).unwrap();
        (dir, index)
    }

    #[test]
    fn empty_index_finds_nothing() {
        let (_dir, index) = open_index();
        assert_eq!(index.get(&key(1)).unwrap(), None);
        assert!(!index.delete(&key(1)).unwrap());
        index.validate().unwrap();
    }

    #[test]
    fn insert_get_delete_single_leaf() {
        let (_dir, index) = open_index();
        for v in [5, 1, 9, 3] {
            assert!(index.insert(&key(v), Rid::new(v, 0)).unwrap());
        }
        assert!(!index.insert(&key(5), Rid::new(99, 0)).unwrap());
        assert_eq!(index.get(&key(3)).unwrap(), Some(Rid::new(3, 0)));
        assert_eq!(index.get(&key(4)).unwrap(), None);

        assert!(index.delete(&key(5)).unwrap());
        assert!(!index.delete(&key(5)).unwrap());
        assert_eq!(index.get(&key(5)).unwrap(), None);
        index.validate().unwrap();
    }

    #[test]
    fn splits_preserve_every_key() {
        let (_dir, index) = open_index();
        let n = index.schema().max_keys() as i32 * 5;
        for v in 0..n {
            assert!(index.insert(&key(v), Rid::new(v, 0)).unwrap(), "insert {v}");
        }
        index.validate().unwrap();
        for v in 0..n {
            assert_eq!(index.get(&key(v)).unwrap(), Some(Rid::new(v, 0)), "get {v}");
        }
    }

    #[test]
    fn descending_inserts_propagate_minimums() {
        let (_dir, index) = open_index();
        let n = index.schema().max_keys() as i32 * 4;
        for v in (0..n).rev() {
            assert!(index.insert(&key(v), Rid::new(v, 0)).unwrap());
        }
        index.validate().unwrap();
        for v in 0..n {
            assert_eq!(index.get(&key(v)).unwrap(), Some(Rid::new(v, 0)));
        }
        assert_eq!(index.get_rid(index.leaf_begin()).unwrap(), Rid::new(0, 0));
    }

    #[test]
    fn bounds_walk_across_leaves() {
        let (_dir, index) = open_index();
        let n = index.schema().max_keys() as i32 * 3;
        // Even keys only, so odd probes fall between entries.
        for v in (0..n).step_by(2) {
            index.insert(&key(v), Rid::new(v, 0)).unwrap();
        }
        let lb = index.lower_bound(&key(5)).unwrap();
        assert_eq!(index.get_rid(lb).unwrap(), Rid::new(6, 0));
        let ub = index.upper_bound(&key(6)).unwrap();
        assert_eq!(index.get_rid(ub).unwrap(), Rid::new(8, 0));

        let past_end = index.lower_bound(&key(n)).unwrap();
        assert_eq!(past_end, index.leaf_end().unwrap());
        assert!(matches!(
            index.get_rid(past_end),
            Err(DbError::IndexEntryNotFound)
        ));
    }

    #[test]
    fn delete_everything_then_reinsert() {
        let (_dir, index) = open_index();
        let n = index.schema().max_keys() as i32 * 3;
        for v in 0..n {
            index.insert(&key(v), Rid::new(v, 0)).unwrap();
        }
        for v in 0..n {
            assert!(index.delete(&key(v)).unwrap(), "delete {v}");
        }
        index.validate().unwrap();
        assert_eq!(index.get(&key(0)).unwrap(), None);
        assert_eq!(index.leaf_begin(), index.leaf_end().unwrap());

        // The tree accepts inserts again after collapsing to empty.
        assert!(index.insert(&key(7), Rid::new(7, 0)).unwrap());
        assert_eq!(index.get(&key(7)).unwrap(), Some(Rid::new(7, 0)));
        index.validate().unwrap();
    }

    #[test]
    fn header_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let disk = Arc::new(DiskManager::new());
        let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 256).unwrap());
        IndexHandle::create(&disk, &path, &int_cols()).unwrap();

        let n;
        {
            let index = IndexHandle::open(Arc::clone(&disk), Arc::clone(&pool), &path).unwrap();
            n = index.schema().max_keys() as i32 * 3;
            for v in 0..n {
                index.insert(&key(v), Rid::new(v, 0)).unwrap();
            }
            index.close().unwrap();
        }

        let index = IndexHandle::open(disk, pool, &path).unwrap();
        index.validate().unwrap();
        for v in 0..n {
            assert_eq!(index.get(&key(v)).unwrap(), Some(Rid::new(v, 0)));
        }
        index.close().unwrap();
    }
}
