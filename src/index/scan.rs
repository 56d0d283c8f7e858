//! Ordered cursor over a half-open range of index positions.
//!
//! The cursor steps slot by slot within a leaf and follows `next_leaf`
//! across leaves until it reaches its end position or the leaf-list
//! sentinel. It holds no tree latch between steps; the caller's
//! transaction-level locks keep the observed entries stable.

use super::handle::IndexHandle;
use super::node::Node;
use super::{Iid, LEAF_HEADER_PAGE};
use crate::errors::Result;
use crate::types::Rid;

pub struct IndexScan<'a> {
    index: &'a IndexHandle,
    iid: Iid,
    end: Iid,
}

impl<'a> IndexScan<'a> {
    pub(crate) fn new(index: &'a IndexHandle, begin: Iid, end: Iid) -> Self {
        Self {
            index,
            iid: begin,
            end,
        }
    }

    /// Advances to the next entry in key order.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.iid.slot_no += 1;
        self.normalize()
    }

    /// Moves the cursor off exhausted leaves onto the next one. Needed
    /// both after a step and at construction, since a lower bound can sit
    /// at the end of a leaf.
    fn normalize(&mut self) -> Result<()> {
        while self.iid != self.end && self.iid.page_no != LEAF_HEADER_PAGE {
            let guard = self.index.fetch_node(self.iid.page_no)?;
            let node = Node::new(guard.data(), self.index.schema())?;
            if (self.iid.slot_no as usize) < node.num_key() {
                return Ok(());
            }
            let next = node.next_leaf();
            if next == LEAF_HEADER_PAGE {
                return Ok(());
            }
            self.iid = Iid::new(next, 0);
        }
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end || self.iid.page_no == LEAF_HEADER_PAGE
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    /// Rid of the current entry.
    pub fn rid(&self) -> Result<Rid> {
        self.index.get_rid(self.iid)
    }

    /// Key of the current entry.
    pub fn key(&self) -> Result<Vec<u8>> {
        self.index.get_key(self.iid)
    }
}
