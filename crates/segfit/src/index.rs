//! Free-block index: small buckets plus a size tree.
//!
//! Free blocks are indexed in two tiers keyed by payload size `S` (words):
//!
//! - `S ∈ {2, 4}`: two fixed LIFO buckets, one per size.
//! - `S ≥ 6`: a binary search tree keyed by size. Each tree node is the
//!   head of a doubly-linked *sibling list* of all free blocks with that
//!   exact size, kept in strictly ascending address order. The head — the
//!   lowest address — doubles as the tree node and is the only sibling with
//!   meaningful child links.
//!
//! This split keeps the hot small sizes O(1) while giving sparse large
//! sizes an ordered ceiling search: [`FreeIndex::find_fit`] returns the
//! lowest-address block of the smallest qualifying size.
//!
//! # Link storage
//!
//! Index links live inside the free blocks' own payloads as 32-bit word
//! offsets from the heap base (the prologue), halving link overhead on
//! 64-bit targets. Offset 0 means "none": the prologue is never a link
//! target. Payload word 1 is `pred`, word 2 `succ` (the sibling list),
//! words 3 and 4 `left` and `right` (the tree) — which is why the tree
//! tier only starts at 4 payload words.

use core::cmp::Ordering;

use crate::block::{Block, MIN_PAYLOAD_WORDS, WORD_BYTES};

/// Number of small buckets.
pub(crate) const SMALL_BINS: usize = 2;

/// Largest payload size held in the small buckets; everything above lives
/// in the size tree.
pub(crate) const SMALL_MAX_WORDS: u32 = 4;

const PRED: usize = 1;
const SUCC: usize = 2;
const LEFT: usize = 3;
const RIGHT: usize = 4;

/// The free-block index.
///
/// Owns no memory: every link is woven through the payloads of the free
/// blocks themselves. The index only stores the bucket heads and the tree
/// root, plus the heap base that offsets are relative to.
pub(crate) struct FreeIndex {
    base: *mut u32,
    bins: [Option<Block>; SMALL_BINS],
    root: Option<Block>,
}

impl FreeIndex {
    /// Creates an empty index over the heap based at `base`.
    pub(crate) fn new(base: *mut u32) -> Self {
        Self {
            base,
            bins: [None; SMALL_BINS],
            root: None,
        }
    }

    /// Inserts a free block into the tier matching its size.
    ///
    /// # Safety
    ///
    /// `block` must designate a live free block that is not currently in
    /// the index.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        unsafe {
            debug_assert!(block.is_free(), "only free blocks are indexed");
            let size = block.size();
            debug_assert!(size >= MIN_PAYLOAD_WORDS && size.is_multiple_of(2));

            if size <= SMALL_MAX_WORDS {
                self.bin_insert(block);
            } else {
                let root = self.root;
                self.root = Some(self.put_sized(block, root));
            }
            debug_assert!(self.contains(block));
        }
    }

    /// Removes a free block from the index.
    ///
    /// # Safety
    ///
    /// `block` must designate a live free block currently in the index.
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        unsafe {
            debug_assert!(self.contains(block));

            if block.size() <= SMALL_MAX_WORDS {
                self.bin_remove(block);
            } else {
                let root = self.root;
                self.root = self.take_sized(block, root);
            }
        }
    }

    /// Best fit: the lowest-address free block of the smallest size that is
    /// at least `words`.
    ///
    /// # Safety
    ///
    /// Every block in the index must still designate a live free block.
    pub(crate) unsafe fn find_fit(&self, words: u32) -> Option<Block> {
        debug_assert!(words >= MIN_PAYLOAD_WORDS && words.is_multiple_of(2));
        unsafe {
            if words <= SMALL_MAX_WORDS
                && let Some(block) = self.small_find_fit(words)
            {
                return Some(block);
            }
            // A tree node heads its sibling list, and the head is the lowest
            // address of that size, so the ceiling node is already the
            // best-fit, lowest-address answer.
            self.ceiling(words, self.root)
        }
    }

    /// Tree root, exposed for the heap checker.
    pub(crate) fn root(&self) -> Option<Block> {
        self.root
    }

    /// Bucket heads, exposed for the heap checker.
    pub(crate) fn bins(&self) -> [Option<Block>; SMALL_BINS] {
        self.bins
    }

    /// Bucket for a small size: 2 → 0, 4 → 1.
    pub(crate) fn bin_index(words: u32) -> usize {
        debug_assert!(
            (MIN_PAYLOAD_WORDS..=SMALL_MAX_WORDS).contains(&words) && words.is_multiple_of(2)
        );
        (words as usize - 2) / 2
    }

    /// Whether `block` is currently indexed, by walking the tier its size
    /// maps to. Checker and debug-assert support.
    ///
    /// # Safety
    ///
    /// `block` and every block in the index must designate live free
    /// blocks.
    pub(crate) unsafe fn contains(&self, block: Block) -> bool {
        unsafe {
            let size = block.size();
            if size <= SMALL_MAX_WORDS {
                let mut cursor = self.bins[Self::bin_index(size)];
                while let Some(candidate) = cursor {
                    if candidate == block {
                        return true;
                    }
                    cursor = self.succ(candidate);
                }
                return false;
            }

            let mut node = self.root;
            while let Some(candidate) = node {
                match size.cmp(&candidate.size()) {
                    Ordering::Less => node = self.left(candidate),
                    Ordering::Greater => node = self.right(candidate),
                    Ordering::Equal => {
                        let mut cursor = Some(candidate);
                        while let Some(sibling) = cursor {
                            if sibling == block {
                                return true;
                            }
                            cursor = self.succ(sibling);
                        }
                        return false;
                    }
                }
            }
            false
        }
    }

    // Link plumbing. Offsets are word counts from the heap base; 0 is nil
    // because the base (the prologue) is never indexed.

    fn decode(&self, offset: u32) -> Option<Block> {
        if offset == 0 {
            None
        } else {
            Some(Block::from_header(unsafe {
                self.base.add(offset as usize)
            }))
        }
    }

    fn encode(&self, link: Option<Block>) -> u32 {
        match link {
            None => 0,
            Some(block) => {
                let delta = block.addr() - self.base.addr();
                debug_assert!(delta.is_multiple_of(WORD_BYTES) && delta > 0);
                u32::try_from(delta / WORD_BYTES).expect("heap offset exceeds 32 bits")
            }
        }
    }

    pub(crate) unsafe fn pred(&self, block: Block) -> Option<Block> {
        self.decode(unsafe { block.payload_word(PRED) })
    }

    pub(crate) unsafe fn succ(&self, block: Block) -> Option<Block> {
        self.decode(unsafe { block.payload_word(SUCC) })
    }

    pub(crate) unsafe fn left(&self, block: Block) -> Option<Block> {
        self.decode(unsafe { block.payload_word(LEFT) })
    }

    pub(crate) unsafe fn right(&self, block: Block) -> Option<Block> {
        self.decode(unsafe { block.payload_word(RIGHT) })
    }

    unsafe fn set_pred(&self, block: Block, link: Option<Block>) {
        unsafe { block.set_payload_word(PRED, self.encode(link)) }
    }

    unsafe fn set_succ(&self, block: Block, link: Option<Block>) {
        unsafe { block.set_payload_word(SUCC, self.encode(link)) }
    }

    unsafe fn set_left(&self, block: Block, link: Option<Block>) {
        unsafe { block.set_payload_word(LEFT, self.encode(link)) }
    }

    unsafe fn set_right(&self, block: Block, link: Option<Block>) {
        unsafe { block.set_payload_word(RIGHT, self.encode(link)) }
    }

    // Small tier: LIFO doubly-linked buckets.

    unsafe fn bin_insert(&mut self, block: Block) {
        unsafe {
            let bin = Self::bin_index(block.size());
            let head = self.bins[bin];
            self.set_pred(block, None);
            self.set_succ(block, head);
            if let Some(head) = head {
                debug_assert!(self.pred(head).is_none());
                self.set_pred(head, Some(block));
            }
            self.bins[bin] = Some(block);
        }
    }

    unsafe fn bin_remove(&mut self, block: Block) {
        unsafe {
            let bin = Self::bin_index(block.size());
            match (self.pred(block), self.succ(block)) {
                (None, None) => {
                    debug_assert_eq!(self.bins[bin], Some(block));
                    self.bins[bin] = None;
                }
                (None, Some(succ)) => {
                    debug_assert_eq!(self.bins[bin], Some(block));
                    self.set_pred(succ, None);
                    self.bins[bin] = Some(succ);
                }
                (Some(pred), None) => self.set_succ(pred, None),
                (Some(pred), Some(succ)) => {
                    self.set_succ(pred, Some(succ));
                    self.set_pred(succ, Some(pred));
                }
            }
        }
    }

    /// First block of size at least `words`, scanning buckets upward from
    /// the one `words` maps to.
    unsafe fn small_find_fit(&self, words: u32) -> Option<Block> {
        unsafe {
            for bin in Self::bin_index(words)..SMALL_BINS {
                let mut cursor = self.bins[bin];
                while let Some(block) = cursor {
                    if block.size() >= words {
                        return Some(block);
                    }
                    cursor = self.succ(block);
                }
            }
            None
        }
    }

    // Large tier: size tree over address-ordered sibling lists.

    /// Inserts `block` into the subtree rooted at `node`, returning the new
    /// subtree root.
    unsafe fn put_sized(&self, block: Block, node: Option<Block>) -> Block {
        unsafe {
            let Some(node) = node else {
                self.set_pred(block, None);
                self.set_succ(block, None);
                self.set_left(block, None);
                self.set_right(block, None);
                return block;
            };
            match block.size().cmp(&node.size()) {
                Ordering::Less => {
                    let left = self.put_sized(block, self.left(node));
                    self.set_left(node, Some(left));
                    node
                }
                Ordering::Greater => {
                    let right = self.put_sized(block, self.right(node));
                    self.set_right(node, Some(right));
                    node
                }
                Ordering::Equal => self.splice_in(block, node),
            }
        }
    }

    /// Splices `block` into the sibling list headed by `head` at its
    /// address position, returning the (possibly new) head.
    unsafe fn splice_in(&self, block: Block, head: Block) -> Block {
        debug_assert_ne!(block, head, "block inserted twice");
        unsafe {
            if block.addr() < head.addr() {
                // `block` becomes the list head, which makes it the tree
                // node: it takes over the children.
                self.set_left(block, self.left(head));
                self.set_right(block, self.right(head));
                self.set_pred(block, None);
                self.set_succ(block, Some(head));
                self.set_pred(head, Some(block));
                return block;
            }

            let mut cursor = head;
            while let Some(next) = self.succ(cursor) {
                if next.addr() > block.addr() {
                    break;
                }
                debug_assert_ne!(next, block, "block inserted twice");
                cursor = next;
            }

            let after = self.succ(cursor);
            self.set_pred(block, Some(cursor));
            self.set_succ(block, after);
            if let Some(after) = after {
                self.set_pred(after, Some(block));
            }
            self.set_succ(cursor, Some(block));
            head
        }
    }

    /// Removes `block` from the subtree rooted at `node`, returning the new
    /// subtree root.
    unsafe fn take_sized(&self, block: Block, node: Option<Block>) -> Option<Block> {
        unsafe {
            let Some(node) = node else {
                debug_assert!(false, "block missing from the size tree");
                return None;
            };
            match block.size().cmp(&node.size()) {
                Ordering::Less => {
                    let left = self.take_sized(block, self.left(node));
                    self.set_left(node, left);
                    Some(node)
                }
                Ordering::Greater => {
                    let right = self.take_sized(block, self.right(node));
                    self.set_right(node, right);
                    Some(node)
                }
                Ordering::Equal => self.unlink_sibling(block, node),
            }
        }
    }

    /// Removes `block` from the sibling list headed by `head`, returning
    /// what takes the node's place in the tree.
    unsafe fn unlink_sibling(&self, block: Block, head: Block) -> Option<Block> {
        unsafe {
            if block != head {
                // Interior or tail sibling: splice it out, the node stays.
                let Some(pred) = self.pred(block) else {
                    debug_assert!(false, "non-head sibling without a predecessor");
                    return Some(head);
                };
                let succ = self.succ(block);
                self.set_succ(pred, succ);
                if let Some(succ) = succ {
                    self.set_pred(succ, Some(pred));
                }
                return Some(head);
            }

            // The node itself: promote the next sibling into the node slot.
            if let Some(next) = self.succ(head) {
                self.set_pred(next, None);
                self.set_left(next, self.left(head));
                self.set_right(next, self.right(head));
                return Some(next);
            }

            // Last block of its size: classic BST deletion through the
            // in-order successor.
            match (self.left(head), self.right(head)) {
                (None, right) => right,
                (left, None) => left,
                (Some(left), Some(right)) => {
                    let successor = self.min_by_size(right);
                    let right = self.delete_min(right);
                    self.set_left(successor, Some(left));
                    self.set_right(successor, right);
                    Some(successor)
                }
            }
        }
    }

    /// Leftmost (smallest-size) node of the subtree rooted at `node`.
    unsafe fn min_by_size(&self, node: Block) -> Block {
        unsafe {
            match self.left(node) {
                None => node,
                Some(left) => self.min_by_size(left),
            }
        }
    }

    /// Removes the leftmost node of the subtree rooted at `node`, returning
    /// the new subtree root.
    unsafe fn delete_min(&self, node: Block) -> Option<Block> {
        unsafe {
            match self.left(node) {
                None => self.right(node),
                Some(left) => {
                    let rest = self.delete_min(left);
                    self.set_left(node, rest);
                    Some(node)
                }
            }
        }
    }

    /// Smallest tree node whose size is at least `words`.
    unsafe fn ceiling(&self, words: u32, node: Option<Block>) -> Option<Block> {
        let node = node?;
        unsafe {
            match words.cmp(&node.size()) {
                Ordering::Equal => Some(node),
                Ordering::Greater => self.ceiling(words, self.right(node)),
                Ordering::Less => self.ceiling(words, self.left(node)).or(Some(node)),
            }
        }
    }
}
