//! The allocator: public operations over the block heap.
//!
//! [`SegFitAllocator`] owns the three pieces of state the design calls for
//! — the heap base, the small buckets, and the size-tree root — and wires
//! the block codec, the free index, boundary-tag coalescing, and the heap
//! source together into the classical four-operation contract.
//!
//! # Heap shape
//!
//! ```text
//! [ prologue ][ block ][ block ] … [ block ][ epilogue ]
//!   size 0,                                   size 0,
//!   allocated                                 allocated
//! ```
//!
//! The two zero-size allocated sentinels terminate coalescing on either
//! edge. The heap only ever grows: when no indexed block fits, the epilogue
//! is overwritten with a fresh free block and a new epilogue is written at
//! the end of the grant.

use heap_source::{HeapSource, SbrkError};
use snafu::{ResultExt, Snafu};

use crate::block::{ALIGN_BYTES, Block, SIZE_MASK, WORD_BYTES};
use crate::index::FreeIndex;

/// Words requested from the source by the initial extension.
const CHUNK_WORDS: u32 = 65;

/// Error returned by [`SegFitAllocator::init`].
#[derive(Debug, Snafu)]
pub enum InitError {
    /// The source could not grant the two sentinel words.
    #[snafu(display("heap source refused the sentinel grant: {source}"))]
    SentinelGrant {
        source: SbrkError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The source could not grant the initial free chunk.
    #[snafu(display("heap source refused the initial chunk: {source}"))]
    InitialChunk {
        source: SbrkError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// A segregated best-fit allocator over a grow-only heap region.
///
/// Single-mutator by design: the allocator takes `&mut self` everywhere and
/// is `Send` but not `Sync`. Wrap it in a lock if it must be shared.
///
/// # Example
///
/// ```
/// use heap_source::ArenaSource;
/// use segfit::SegFitAllocator;
///
/// let mut backing = vec![0_u64; 1024];
/// let arena = unsafe { ArenaSource::new(backing.as_mut_ptr().cast(), 8192) };
/// let mut heap = SegFitAllocator::init(arena).unwrap();
///
/// let p = heap.allocate(64).unwrap();
/// unsafe {
///     p.write_bytes(0x5A, 64);
///     heap.free(p);
/// }
/// ```
pub struct SegFitAllocator<S> {
    pub(crate) source: S,
    pub(crate) base: *mut u32,
    pub(crate) index: FreeIndex,
}

unsafe impl<S: Send> Send for SegFitAllocator<S> {}

impl<S: HeapSource> SegFitAllocator<S> {
    /// Initializes an allocator over `source`: writes the prologue and
    /// epilogue sentinels, then extends the heap by an initial chunk.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] when the source cannot grant the sentinels or
    /// the initial chunk.
    ///
    /// # Panics
    ///
    /// Panics if the source's first grant is not 8-byte aligned; sentinel
    /// placement relies on it to keep every payload aligned.
    pub fn init(mut source: S) -> Result<Self, InitError> {
        let sentinels = source.sbrk(2 * WORD_BYTES).context(SentinelGrantSnafu)?;
        let base = sentinels.as_ptr().cast::<u32>();
        assert!(
            base.addr().is_multiple_of(ALIGN_BYTES),
            "heap base must be 8-byte aligned"
        );

        unsafe {
            // Prologue at the base, epilogue right behind it; extension
            // rewrites the epilogue into the first real block.
            Block::from_header(base).write_alloc(0, false);
            Block::from_header(base.add(1)).write_alloc(0, false);
        }

        let mut heap = Self {
            source,
            base,
            index: FreeIndex::new(base),
        };
        unsafe {
            heap.extend(CHUNK_WORDS).context(InitialChunkSnafu)?;
        }
        log::debug!(
            "segfit heap initialized: {} bytes at {base:p}",
            heap.source.size()
        );
        Ok(heap)
    }

    /// Allocates `size` bytes and returns an 8-byte-aligned payload
    /// pointer, or `None` when `size` is zero or memory is exhausted.
    ///
    /// A failed allocation leaves the heap unchanged.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        #[cfg(debug_assertions)]
        self.assert_consistent();

        if size == 0 {
            return None;
        }
        let awords = Self::payload_words(size)?;

        unsafe {
            // Index sizes count free payloads, which are one word shorter
            // than the allocated payload they can back (the footer word is
            // reclaimed on placement).
            if let Some(block) = self.index.find_fit(awords - 1) {
                self.place(block, awords);
                log::trace!("allocate({size}) -> {:p} (reused)", block.payload());
                return Some(block.payload());
            }

            let mut ewords = awords;
            let epilogue = self.epilogue();
            if epilogue.prev_is_free() {
                // The trailing free block gets absorbed by the post-extension
                // coalesce, so extend by that much less. It cannot cover the
                // request on its own, otherwise find_fit would have taken it.
                let last = epilogue.prev().size();
                assert!(
                    last + 1 < ewords,
                    "trailing free block of {last} words should have satisfied the request"
                );
                ewords -= last + 2;
            }

            let block = match self.extend(ewords) {
                Ok(block) => block,
                Err(err) => {
                    log::debug!("allocate({size}): extension failed: {err}");
                    return None;
                }
            };
            self.place(block, awords);
            log::trace!("allocate({size}) -> {:p} (extended)", block.payload());
            Some(block.payload())
        }
    }

    /// Frees the block backing `ptr`. A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator's
    /// [`allocate`](Self::allocate), [`reallocate`](Self::reallocate), or
    /// [`callocate`](Self::callocate) and not yet freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        #[cfg(debug_assertions)]
        self.assert_consistent();

        if ptr.is_null() {
            return;
        }
        log::trace!("free({ptr:p})");
        unsafe {
            let block = Block::from_payload(ptr);
            debug_assert!(!block.is_free(), "double free");
            // Flag the successor now; coalescing never revisits it.
            block.next().set_prev_free(true);
            self.coalesce(block);
        }
    }

    /// Resizes the allocation backing `ptr` to `size` bytes.
    ///
    /// Null `ptr` behaves like [`allocate`](Self::allocate); zero `size`
    /// behaves like [`free`](Self::free) and returns `None`. Shrinks and
    /// successor absorption happen in place; otherwise the payload moves
    /// and the old block is freed. On failure the old block is untouched
    /// and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same requirements as [`free`](Self::free).
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            unsafe { self.free(ptr) };
            return None;
        }

        #[cfg(debug_assertions)]
        self.assert_consistent();
        log::trace!("reallocate({ptr:p}, {size})");

        unsafe {
            let block = Block::from_payload(ptr);
            debug_assert!(!block.is_free(), "reallocating a freed block");
            let words = block.size();
            let nwords = Self::payload_words(size)?;

            // Equal, or a shrink too small to carve a minimum free block
            // out of: leave the block as it is.
            if nwords == words || (words > nwords && words - nwords < 4) {
                return Some(ptr);
            }

            if words > nwords {
                self.shrink_in_place(block, words, nwords);
                return Some(ptr);
            }

            if let Some(ptr) = self.grow_into_successor(block, words, nwords) {
                return Some(ptr);
            }

            // No room behind the block: move the payload. The old block is
            // only released once the new one exists, so an allocation
            // failure here leaves everything intact.
            let new_ptr = self.allocate(size)?;
            core::ptr::copy_nonoverlapping(ptr, new_ptr, words as usize * WORD_BYTES);
            self.free(ptr);
            Some(new_ptr)
        }
    }

    /// Allocates `count * size` bytes, zeroed.
    ///
    /// Returns `None` on overflow, a zero total, or exhaustion.
    pub fn callocate(&mut self, count: usize, size: usize) -> Option<*mut u8> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;
        unsafe { ptr.write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Current heap length in bytes.
    pub fn heap_size(&self) -> usize {
        self.source.size()
    }

    /// Whether `ptr` points into the heap region.
    pub(crate) fn in_heap<T>(&self, ptr: *const T) -> bool {
        let addr = ptr.addr();
        self.source.lo().addr() <= addr && addr <= self.source.hi().addr()
    }

    /// The epilogue sentinel: the last word of the region.
    pub(crate) unsafe fn epilogue(&self) -> Block {
        Block::from_header(unsafe { self.source.hi().sub(3) }.cast::<u32>())
    }

    /// Converts a byte request into allocated payload words: at least 3,
    /// always odd, so the payload covers the request and the next header
    /// stays 8-byte aligned without a footer.
    fn payload_words(size: usize) -> Option<u32> {
        let words = if size <= 12 {
            3
        } else {
            3 + (size - 12).div_ceil(8).checked_mul(2)?
        };
        u32::try_from(words).ok().filter(|&w| w <= SIZE_MASK)
    }

    /// Grows the heap by `words` (odd) plus one header word, shaping the
    /// grant into a free block that replaces the old epilogue, and
    /// coalesces it with a free trailing block.
    ///
    /// On error the heap is unchanged.
    unsafe fn extend(&mut self, words: u32) -> Result<Block, SbrkError> {
        debug_assert!(words % 2 == 1, "extension must keep the heap word-odd");

        let grant = self.source.sbrk((words as usize + 1) * WORD_BYTES)?;
        log::debug!("extend: +{} bytes", (words + 1) * 4);

        unsafe {
            // The grant starts one word past the old epilogue; back up onto
            // it so it becomes the new block's header.
            let block = Block::from_header(grant.as_ptr().cast::<u32>().sub(1));
            let prev_free = block.prev_is_free();
            block.write_free(words - 1, prev_free);

            let epilogue = block.next();
            epilogue.write_alloc(0, true);
            debug_assert_eq!(epilogue.header_ptr(), self.epilogue().header_ptr());

            Ok(self.coalesce(block))
        }
    }

    /// Merges `block` with whichever physical neighbors are free, indexes
    /// the result, and returns it.
    ///
    /// `block` is either freshly freed (still marked allocated; its footer
    /// word rejoins the payload) or a new extension block (already free).
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        unsafe {
            let next = block.next();
            let prev_free = block.prev_is_free();
            let next_free = next.is_free();

            let mut words = block.size();
            if !block.is_free() {
                words -= 1;
            }

            let merged = match (prev_free, next_free) {
                (true, true) => {
                    let prev = block.prev();
                    self.index.remove(prev);
                    self.index.remove(next);
                    words += prev.size() + next.size() + 4;
                    prev.write_free(words, false);
                    prev
                }
                (false, true) => {
                    self.index.remove(next);
                    words += next.size() + 2;
                    block.write_free(words, false);
                    block
                }
                (true, false) => {
                    let prev = block.prev();
                    self.index.remove(prev);
                    words += prev.size() + 2;
                    prev.write_free(words, false);
                    prev
                }
                (false, false) => {
                    block.write_free(words, false);
                    block
                }
            };

            self.index.insert(merged);
            merged
        }
    }

    /// Carves an allocation of `awords` payload words out of the free
    /// `block`, splitting off the remainder when it can stand as a block of
    /// its own.
    unsafe fn place(&mut self, block: Block, awords: u32) {
        unsafe {
            let cwords = block.size();
            debug_assert!(cwords + 1 >= awords);
            self.index.remove(block);

            // A free neighbor would have been coalesced away already.
            debug_assert!(!block.prev_is_free());

            if cwords >= awords + 3 {
                // Remainder can hold a header, two payload words and a
                // footer: split.
                block.write_alloc(awords, false);

                let rest = block.next();
                rest.write_free(cwords - awords - 1, false);
                self.index.insert(rest);
            } else {
                // Absorb whole; the footer word rejoins the payload.
                block.write_alloc(cwords + 1, false);

                let next = block.next();
                debug_assert!(!next.is_free());
                next.set_prev_free(false);
            }
        }
    }

    /// In-place shrink: resize to `nwords` and free the tail, merging it
    /// with a free successor.
    unsafe fn shrink_in_place(&mut self, block: Block, words: u32, nwords: u32) {
        debug_assert!(words - nwords >= 4);
        unsafe {
            block.write_alloc(nwords, block.prev_is_free());

            let rest = block.next();
            let rwords = words - nwords - 2;
            rest.write_free(rwords, false);

            let next = rest.next();
            if next.is_free() {
                self.index.remove(next);
                rest.write_free(rwords + next.size() + 2, false);
            } else {
                next.set_prev_free(true);
            }
            self.index.insert(rest);
        }
    }

    /// Tries to grow `block` from `words` to `nwords` payload words by
    /// absorbing a free successor, splitting off whatever is left over.
    /// Returns the unchanged payload pointer on success.
    unsafe fn grow_into_successor(
        &mut self,
        block: Block,
        words: u32,
        nwords: u32,
    ) -> Option<*mut u8> {
        unsafe {
            let next = block.next();
            if !next.is_free() {
                return None;
            }

            let owords = next.size();
            let need = nwords - words;
            // The successor contributes its payload plus the header that
            // disappears in the merge.
            if owords + 1 >= need + 3 {
                self.index.remove(next);
                block.write_alloc(nwords, block.prev_is_free());

                let rest = block.next();
                rest.write_free(owords - need, false);
                self.index.insert(rest);
                Some(block.payload())
            } else if owords + 1 >= need {
                self.index.remove(next);
                block.write_alloc(words + owords + 2, block.prev_is_free());

                let after = block.next();
                debug_assert!(!after.is_free());
                after.set_prev_free(false);
                Some(block.payload())
            } else {
                None
            }
        }
    }

    /// Debug-build guard run at the top of every public operation.
    #[cfg(debug_assertions)]
    pub(crate) fn assert_consistent(&self) {
        if let Err(err) = self.check_heap(true) {
            panic!("heap check failed: {err}");
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use heap_source::ArenaSource;
    use proptest::prelude::*;

    use super::*;

    struct TestHeap {
        heap: SegFitAllocator<ArenaSource>,
        _backing: Vec<u64>,
    }

    fn test_heap(capacity: usize) -> TestHeap {
        let _ = env_logger::try_init();
        let mut backing = vec![0_u64; capacity.div_ceil(8)];
        let arena = unsafe { ArenaSource::new(backing.as_mut_ptr().cast(), capacity) };
        let heap = SegFitAllocator::init(arena).unwrap();
        TestHeap {
            heap,
            _backing: backing,
        }
    }

    /// Snapshot of `(address, payload words)` for every free block, in heap
    /// order.
    fn free_blocks(heap: &SegFitAllocator<ArenaSource>) -> Vec<(usize, u32)> {
        unsafe {
            let mut out = Vec::new();
            let mut block = Block::from_header(heap.base).next();
            while block.size() > 0 {
                if block.is_free() {
                    out.push((block.addr(), block.size()));
                }
                block = block.next();
            }
            out
        }
    }

    #[test]
    fn test_basic_allocation() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p = heap.allocate(64).unwrap();
        assert_eq!(p.addr() % 8, 0);
        unsafe {
            p.write_bytes(0x5A, 64);
            for i in 0..64 {
                assert_eq!(p.add(i).read(), 0x5A);
            }
            heap.free(p);
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_zero_size_requests_return_nil() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        assert!(heap.allocate(0).is_none());
        unsafe {
            heap.free(core::ptr::null_mut());

            let p = heap.allocate(16).unwrap();
            assert!(heap.reallocate(p, 0).is_none());
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_every_pointer_is_aligned() {
        let mut th = test_heap(16 * 1024);
        let heap = &mut th.heap;

        for size in [1, 7, 12, 13, 24, 100, 255, 1000] {
            let p = heap.allocate(size).unwrap();
            assert_eq!(p.addr() % 8, 0, "allocate({size}) misaligned");
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_split_leaves_freed_small_block_in_bucket() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p1 = heap.allocate(16).unwrap();
        let p2 = heap.allocate(16).unwrap();
        unsafe {
            heap.free(p1);

            // 16 bytes is a 5-word allocated block; freeing it yields a
            // 4-word free block, which belongs in the second bucket.
            let freed = Block::from_payload(p1);
            assert_eq!(freed.size(), 4);
            assert_eq!(heap.index.bins(), [None, Some(freed)]);

            // The neighbor is untouched.
            assert!(!Block::from_payload(p2).is_free());
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_freeing_all_three_neighbors_coalesces_into_one_block() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        let c = heap.allocate(16).unwrap();
        // Keeps `c` away from the free tail of the initial chunk.
        let _guard = heap.allocate(16).unwrap();

        unsafe {
            heap.free(a);
            heap.free(c);
            heap.free(b);

            // Three 4-word payloads plus the two interior header/footer
            // pairs merge into one 16-word block at `a`.
            let merged = Block::from_payload(a);
            assert_eq!(merged.size(), 16);
            assert!(merged.is_free());
        }

        // Nothing may linger in the small buckets.
        assert_eq!(heap.index.bins(), [None, None]);
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_equal_fit_returns_the_lowest_address() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let blocks: Vec<_> = (0..6).map(|_| heap.allocate(40).unwrap()).collect();
        unsafe {
            // Three identically sized holes, freed out of address order,
            // each fenced by live neighbors.
            heap.free(blocks[2]);
            heap.free(blocks[0]);
            heap.free(blocks[4]);
        }
        heap.check_heap(true).unwrap();

        assert_eq!(heap.allocate(40).unwrap(), blocks[0]);
        assert_eq!(heap.allocate(40).unwrap(), blocks[2]);
        assert_eq!(heap.allocate(40).unwrap(), blocks[4]);
    }

    #[test]
    fn test_free_then_same_size_allocation_reuses_the_region() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p = heap.allocate(48).unwrap();
        unsafe { heap.free(p) };
        assert_eq!(heap.allocate(48).unwrap(), p);
    }

    #[test]
    fn test_realloc_shrink_splits_off_the_tail() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        // 256 bytes is a 65-word block: the whole initial chunk.
        let p = heap.allocate(256).unwrap();
        assert!(free_blocks(heap).is_empty());

        unsafe {
            p.write_bytes(0x7E, 64);
            assert_eq!(heap.reallocate(p, 64), Some(p));
            for i in 0..64 {
                assert_eq!(p.add(i).read(), 0x7E);
            }
        }

        // 65 words shrink to 17; the tail resurfaces as one free block.
        let frees = free_blocks(heap);
        assert_eq!(frees.len(), 1);
        assert_eq!(frees[0].1, 46);
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_realloc_shrink_merges_tail_with_free_successor() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        // A 25-word block followed by the 38-word free rest of the chunk.
        let p = heap.allocate(100).unwrap();
        assert_eq!(free_blocks(heap).len(), 1);

        unsafe {
            assert_eq!(heap.reallocate(p, 16), Some(p));
        }

        // The 18-word tail must merge with the free successor rather than
        // sit next to it.
        let frees = free_blocks(heap);
        assert_eq!(frees.len(), 1);
        assert_eq!(frees[0].1, 58);
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_realloc_tiny_shrink_is_a_no_op() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p = heap.allocate(64).unwrap();
        let before = free_blocks(heap);
        unsafe {
            // One word less: too small to carve a free block out of.
            assert_eq!(heap.reallocate(p, 60), Some(p));
        }
        assert_eq!(free_blocks(heap), before);
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_realloc_grow_absorbs_free_successor_in_place() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p = heap.allocate(64).unwrap();
        let q = heap.allocate(64).unwrap();
        unsafe {
            p.write_bytes(0x3C, 64);
            // Freeing `q` merges it with the chunk tail behind it.
            heap.free(q);

            assert_eq!(heap.reallocate(p, 120), Some(p));
            for i in 0..64 {
                assert_eq!(p.add(i).read(), 0x3C);
            }
            assert!(!Block::from_payload(p).is_free());
            assert!(Block::from_payload(p).size() >= 31);
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_realloc_grow_consumes_small_successor_entirely() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p = heap.allocate(64).unwrap();
        let q = heap.allocate(16).unwrap();
        let guard = heap.allocate(16).unwrap();
        unsafe {
            p.write_bytes(0x99, 64);
            heap.free(q);

            // The 4-word hole cannot be split after covering the growth;
            // the block swallows it whole.
            assert_eq!(heap.reallocate(p, 80), Some(p));
            assert_eq!(Block::from_payload(p).size(), 23);
            for i in 0..64 {
                assert_eq!(p.add(i).read(), 0x99);
            }
            assert!(!Block::from_payload(guard).prev_is_free());
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_realloc_moves_when_it_cannot_grow_in_place() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        let p = heap.allocate(16).unwrap();
        let _wall = heap.allocate(16).unwrap();
        unsafe {
            p.write_bytes(0xA1, 16);

            let q = heap.reallocate(p, 200).unwrap();
            assert_ne!(q, p);
            for i in 0..16 {
                assert_eq!(q.add(i).read(), 0xA1);
            }
            // The old block went back to the free index.
            assert!(Block::from_payload(p).is_free());
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_callocate_returns_zeroed_memory() {
        let mut th = test_heap(8192);
        let heap = &mut th.heap;

        // Dirty a region first so the zeroing is observable.
        let p = heap.allocate(120).unwrap();
        unsafe {
            p.write_bytes(0xFF, 120);
            heap.free(p);
        }

        let q = heap.callocate(3, 40).unwrap();
        unsafe {
            for i in 0..120 {
                assert_eq!(q.add(i).read(), 0, "byte {i} not zeroed");
            }
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_callocate_rejects_overflow() {
        let mut th = test_heap(8192);
        assert!(th.heap.callocate(usize::MAX, 2).is_none());
        assert!(th.heap.callocate(0, 8).is_none());
    }

    #[test]
    fn test_exhaustion_returns_nil_and_spares_live_blocks() {
        // Just enough capacity for the sentinels, the initial chunk, and a
        // little slack.
        let mut th = test_heap(512);
        let heap = &mut th.heap;

        let p = heap.allocate(16).unwrap();
        unsafe { p.write_bytes(0x44, 16) };

        assert!(heap.allocate(4096).is_none());
        heap.check_heap(true).unwrap();

        unsafe {
            for i in 0..16 {
                assert_eq!(p.add(i).read(), 0x44);
            }
        }
        // Small requests still succeed from what is left.
        assert!(heap.allocate(16).is_some());
    }

    #[test]
    fn test_heap_extends_when_the_index_cannot_satisfy() {
        let mut th = test_heap(64 * 1024);
        let heap = &mut th.heap;

        let before = heap.heap_size();
        let p = heap.allocate(2048).unwrap();
        assert!(heap.heap_size() > before);
        unsafe {
            p.write_bytes(0x11, 2048);
            assert_eq!(p.add(2047).read(), 0x11);
        }
        heap.check_heap(true).unwrap();
    }

    #[test]
    fn test_payload_survives_unrelated_churn() {
        let mut th = test_heap(32 * 1024);
        let heap = &mut th.heap;

        let keeper = heap.allocate(64).unwrap();
        unsafe {
            for i in 0..64 {
                keeper.add(i).write(i as u8);
            }
        }

        for round in 0..50 {
            let a = heap.allocate(24 + round).unwrap();
            let b = heap.allocate(80).unwrap();
            unsafe {
                a.write_bytes(0xEE, 24 + round);
                heap.free(a);
                heap.free(b);
            }
        }

        unsafe {
            for i in 0..64 {
                assert_eq!(keeper.add(i).read(), i as u8);
            }
        }
        heap.check_heap(true).unwrap();
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(usize),
        Free(usize),
        Realloc(usize, usize),
        Calloc(usize, usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![
                (0_usize..300).prop_map(Op::Alloc),
                (0_usize..40).prop_map(Op::Free),
                ((0_usize..40), (0_usize..300)).prop_map(|(i, n)| Op::Realloc(i, n)),
                ((0_usize..8), (0_usize..40)).prop_map(|(k, n)| Op::Calloc(k, n)),
            ],
            0..60,
        )
    }

    proptest! {
        /// Random operation sequences keep every structural invariant
        /// intact, never hand out misaligned or overlapping memory, and
        /// leave a fully coalesced heap once everything is freed again.
        #[test]
        fn random_operation_sequences_keep_the_heap_valid(ops in ops()) {
            let mut th = test_heap(64 * 1024);
            let heap = &mut th.heap;

            // Shadow model: live payloads with their fill byte.
            let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
            let mut stamp: u8 = 0;

            for op in ops {
                match op {
                    Op::Alloc(n) => {
                        if let Some(p) = heap.allocate(n) {
                            prop_assert_eq!(p.addr() % 8, 0);
                            stamp = stamp.wrapping_add(1);
                            unsafe { p.write_bytes(stamp, n) };
                            live.push((p, n, stamp));
                        } else {
                            // The arena is far larger than the op budget.
                            prop_assert_eq!(n, 0);
                        }
                    }
                    Op::Free(i) => {
                        if !live.is_empty() {
                            let (p, n, fill) = live.swap_remove(i % live.len());
                            unsafe {
                                for j in 0..n {
                                    prop_assert_eq!(p.add(j).read(), fill);
                                }
                                heap.free(p);
                            }
                        }
                    }
                    Op::Realloc(i, n) => {
                        if !live.is_empty() {
                            let idx = i % live.len();
                            let (p, old_n, fill) = live[idx];
                            if n == 0 {
                                unsafe {
                                    prop_assert!(heap.reallocate(p, 0).is_none());
                                }
                                live.swap_remove(idx);
                            } else if let Some(q) = unsafe { heap.reallocate(p, n) } {
                                let keep = old_n.min(n);
                                unsafe {
                                    for j in 0..keep {
                                        prop_assert_eq!(q.add(j).read(), fill);
                                    }
                                    stamp = stamp.wrapping_add(1);
                                    q.write_bytes(stamp, n);
                                }
                                live[idx] = (q, n, stamp);
                            }
                        }
                    }
                    Op::Calloc(k, n) => {
                        if let Some(p) = heap.callocate(k, n) {
                            let total = k * n;
                            unsafe {
                                for j in 0..total {
                                    prop_assert_eq!(p.add(j).read(), 0);
                                }
                                stamp = stamp.wrapping_add(1);
                                p.write_bytes(stamp, total);
                            }
                            live.push((p, total, stamp));
                        }
                    }
                }
                heap.check_heap(true).unwrap();
            }

            // Whatever is still live must be intact; then release it.
            for (p, n, fill) in live.drain(..) {
                unsafe {
                    for j in 0..n {
                        prop_assert_eq!(p.add(j).read(), fill);
                    }
                    heap.free(p);
                }
            }
            heap.check_heap(true).unwrap();

            // With nothing live, coalescing must leave exactly one free
            // block.
            prop_assert_eq!(free_blocks(heap).len(), 1);
        }
    }
}
