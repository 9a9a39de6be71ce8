//! Intrusive doubly-linked block list.
//!
//! The linkage lives in the first bytes of each block, so putting a block
//! on a list costs no extra allocation. Only head/tail operations are
//! needed: the realtime side pops from the head and pushes to the tail,
//! and the replenisher stages and drains in the same order.

use std::ptr::{self, NonNull};

/// List linkage stored at the front of every block.
///
/// Valid only while the block sits on a list. Once a block is handed out,
/// these bytes are dead storage until the block is pushed back.
#[repr(C)]
pub(crate) struct BlockLink {
    prev: *mut BlockLink,
    next: *mut BlockLink,
}

/// An ordered sequence of blocks with O(1) push-tail and pop-head.
pub(crate) struct BlockList {
    head: *mut BlockLink,
    tail: *mut BlockLink,
    len: usize,
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Append a block to the tail of the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a live block whose linkage bytes the caller
    /// hands over to the list. The block must not already be on any list.
    #[inline]
    pub(crate) unsafe fn push_tail(&mut self, node: NonNull<BlockLink>) {
        // SAFETY: Caller guarantees exclusive ownership of the node.
        unsafe {
            let node_ptr = node.as_ptr();
            (*node_ptr).prev = self.tail;
            (*node_ptr).next = ptr::null_mut();

            if self.tail.is_null() {
                self.head = node_ptr;
            } else {
                (*self.tail).next = node_ptr;
            }
            self.tail = node_ptr;
        }
        self.len += 1;
    }

    /// Detach and return the head of the list.
    ///
    /// The caller takes back ownership of the block; its linkage bytes
    /// are dead until it is pushed again.
    #[inline]
    pub(crate) fn pop_head(&mut self) -> Option<NonNull<BlockLink>> {
        let head = NonNull::new(self.head)?;

        // SAFETY: Every node on the list was handed over via push_tail
        // and stays valid until popped.
        unsafe {
            let next = head.as_ref().next;
            self.head = next;
            if next.is_null() {
                self.tail = ptr::null_mut();
            } else {
                (*next).prev = ptr::null_mut();
            }
        }
        self.len -= 1;
        Some(head)
    }
}
