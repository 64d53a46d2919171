//! Structural heap validation.
//!
//! [`SegFitAllocator::check_heap`] walks the heap from prologue to epilogue
//! and then the free index, verifying every structural invariant the
//! allocator relies on. It exists for tests and debug builds; the public
//! operations assume their preconditions and never run it in release
//! builds.

use heap_source::HeapSource;
use snafu::{Snafu, ensure};

use crate::block::{ALIGN_BYTES, Block, MIN_PAYLOAD_WORDS};
use crate::heap::SegFitAllocator;
use crate::index::SMALL_MAX_WORDS;

/// A violated heap invariant, reported by [`SegFitAllocator::check_heap`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CheckError {
    /// The prologue sentinel is no longer a zero-size allocated block.
    #[snafu(display("prologue sentinel clobbered"))]
    PrologueClobbered {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The epilogue sentinel is marked free.
    #[snafu(display("epilogue sentinel clobbered"))]
    EpilogueClobbered {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A block header lies outside the heap region.
    #[snafu(display("block {addr:#x} is outside the heap"))]
    OutOfBounds {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A payload is not 8-byte aligned.
    #[snafu(display("payload of block {addr:#x} is misaligned"))]
    MisalignedPayload {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A block is smaller than the two-word minimum payload.
    #[snafu(display("block {addr:#x} has undersized payload of {words} words"))]
    Undersized {
        addr: usize,
        words: u32,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// Allocated payloads must be odd, free payloads even.
    #[snafu(display(
        "block {addr:#x} (free: {free}) has {words} payload words of the wrong parity"
    ))]
    WrongParity {
        addr: usize,
        words: u32,
        free: bool,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A free block's footer does not mirror its header.
    #[snafu(display("header and footer of free block {addr:#x} disagree"))]
    FooterMismatch {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// Two physically adjacent blocks are both free.
    #[snafu(display("free block {addr:#x} has a free physical neighbor"))]
    AdjacentFree {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A block's prev-free bit contradicts its predecessor's state.
    #[snafu(display("prev-free bit of block {addr:#x} is stale"))]
    StalePrevFreeBit {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A free block reachable by the heap walk is missing from the index.
    #[snafu(display("free block {addr:#x} is not in the free index"))]
    UnindexedFree {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// An indexed block is marked allocated.
    #[snafu(display("indexed block {addr:#x} is marked allocated"))]
    AllocatedInIndex {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// Sibling pred/succ links are not mutually consistent.
    #[snafu(display("list links around block {addr:#x} are inconsistent"))]
    InconsistentLinks {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A block sits in a bucket of the wrong size.
    #[snafu(display("block {addr:#x} of {words} words does not belong in bucket {bin}"))]
    WrongBin {
        addr: usize,
        words: u32,
        bin: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A bucket-tier size ended up in the size tree.
    #[snafu(display("block {addr:#x} of {words} words does not belong in the size tree"))]
    MistieredBlock {
        addr: usize,
        words: u32,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The size tree violates its strict ordering.
    #[snafu(display("size tree ordering violated at block {addr:#x}"))]
    UnsortedTree {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A sibling list mixes sizes.
    #[snafu(display("sibling of block {addr:#x} differs in size"))]
    SiblingSizeMismatch {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A sibling list is not in strictly ascending address order.
    #[snafu(display("sibling list around block {addr:#x} is not address ordered"))]
    SiblingOrder {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

impl<S: HeapSource> SegFitAllocator<S> {
    /// Validates every structural invariant of the heap and the free index.
    ///
    /// With `verbose` set, the violation is also logged through
    /// [`log::error!`]. The free-block counts of the heap walk and the index
    /// walk are cross-checked as a soft diagnostic: a mismatch is logged,
    /// never an error.
    ///
    /// # Errors
    ///
    /// The first violated invariant, as a [`CheckError`].
    pub fn check_heap(&self, verbose: bool) -> Result<(), CheckError> {
        let result = self.run_check();
        if verbose && let Err(err) = &result {
            log::error!("heap check failed: {err}");
        }
        result
    }

    fn run_check(&self) -> Result<(), CheckError> {
        unsafe {
            let prologue = Block::from_header(self.base);
            ensure!(
                prologue.size() == 0 && !prologue.is_free() && !prologue.prev_is_free(),
                PrologueClobberedSnafu
            );

            // Heap walk: prologue to epilogue, no gaps. Each block's
            // prev-free bit is compared against the state the walk just
            // came from.
            let mut heap_free = 0_usize;
            let mut prev_was_free = false;
            let mut block = prologue.next();
            while block.size() > 0 {
                let addr = block.addr();
                ensure!(self.in_heap(block.header_ptr()), OutOfBoundsSnafu { addr });
                ensure!(
                    block.payload().addr().is_multiple_of(ALIGN_BYTES),
                    MisalignedPayloadSnafu { addr }
                );

                let words = block.size();
                let free = block.is_free();
                ensure!(words >= MIN_PAYLOAD_WORDS, UndersizedSnafu { addr, words });
                ensure!(
                    free == (words % 2 == 0),
                    WrongParitySnafu { addr, words, free }
                );
                ensure!(
                    block.prev_is_free() == prev_was_free,
                    StalePrevFreeBitSnafu { addr }
                );

                if free {
                    heap_free += 1;
                    ensure!(block.footer_matches(), FooterMismatchSnafu { addr });
                    ensure!(
                        !prev_was_free && !block.next().is_free(),
                        AdjacentFreeSnafu { addr }
                    );
                    ensure!(self.index.contains(block), UnindexedFreeSnafu { addr });
                }

                prev_was_free = free;
                block = block.next();
            }
            ensure!(!block.is_free(), EpilogueClobberedSnafu);
            ensure!(
                block.prev_is_free() == prev_was_free,
                StalePrevFreeBitSnafu { addr: block.addr() }
            );

            // Index walk: buckets, then the tree.
            let mut index_free = 0_usize;
            for (bin, head) in self.index.bins().into_iter().enumerate() {
                let mut prev: Option<Block> = None;
                let mut cursor = head;
                while let Some(candidate) = cursor {
                    index_free += 1;
                    let addr = candidate.addr();
                    ensure!(
                        self.in_heap(candidate.header_ptr()),
                        OutOfBoundsSnafu { addr }
                    );
                    ensure!(candidate.is_free(), AllocatedInIndexSnafu { addr });
                    let words = candidate.size();
                    ensure!(
                        (words == 2 && bin == 0) || (words == 4 && bin == 1),
                        WrongBinSnafu { addr, words, bin }
                    );
                    ensure!(
                        self.index.pred(candidate) == prev,
                        InconsistentLinksSnafu { addr }
                    );
                    prev = Some(candidate);
                    cursor = self.index.succ(candidate);
                }
            }
            self.check_tree(self.index.root(), None, None, &mut index_free)?;

            // Soft diagnostic by design: any real divergence shows up above
            // as a hard error first.
            if heap_free != index_free {
                log::warn!(
                    "free-block counts disagree: heap walk {heap_free}, index walk {index_free}"
                );
            }
            Ok(())
        }
    }

    /// Validates the subtree rooted at `node` against the open size bounds
    /// `(lo, hi)`, walking each node's sibling list along the way.
    unsafe fn check_tree(
        &self,
        node: Option<Block>,
        lo: Option<u32>,
        hi: Option<u32>,
        count: &mut usize,
    ) -> Result<(), CheckError> {
        let Some(node) = node else {
            return Ok(());
        };
        unsafe {
            let size = node.size();
            let addr = node.addr();
            ensure!(size > SMALL_MAX_WORDS, MistieredBlockSnafu { addr, words: size });
            ensure!(
                lo.is_none_or(|lo| size > lo) && hi.is_none_or(|hi| size < hi),
                UnsortedTreeSnafu { addr }
            );

            let mut prev: Option<Block> = None;
            let mut cursor = Some(node);
            while let Some(sibling) = cursor {
                *count += 1;
                let addr = sibling.addr();
                ensure!(
                    self.in_heap(sibling.header_ptr()),
                    OutOfBoundsSnafu { addr }
                );
                ensure!(sibling.is_free(), AllocatedInIndexSnafu { addr });
                ensure!(sibling.size() == size, SiblingSizeMismatchSnafu { addr });
                ensure!(
                    self.index.pred(sibling) == prev,
                    InconsistentLinksSnafu { addr }
                );
                if let Some(prev) = prev {
                    ensure!(prev.addr() < addr, SiblingOrderSnafu { addr });
                }
                prev = Some(sibling);
                cursor = self.index.succ(sibling);
            }

            self.check_tree(self.index.left(node), lo, Some(size), count)?;
            self.check_tree(self.index.right(node), Some(size), hi, count)?;
            Ok(())
        }
    }
}
