//! Block layout and header codec.
//!
//! The heap is a contiguous run of 4-byte words. Every block is one header
//! word, a payload of `size` words, and — on free blocks only — a footer
//! word mirroring the header:
//!
//! ```text
//! allocated:  [ header ][ payload : size words            ]
//! free:       [ header ][ payload : size words ][ footer  ]
//! ```
//!
//! The header packs three fields into 32 bits:
//!
//! - bits 0–29: payload size in words (header and footer excluded),
//! - bit 30: this block is allocated,
//! - bit 31: the physically preceding block is free.
//!
//! Allocated blocks carry no footer; their successor learns whether the
//! predecessor is free from its own bit 31 instead of reading a boundary
//! tag. That bit is what [`Block::prev`] is preconditioned on: the footer it
//! reads only exists when the predecessor is free. One consequence worth
//! keeping in mind everywhere: allocated payload sizes are odd, free ones
//! even, so that payloads stay 8-byte aligned with and without a footer.

/// Size of one heap word in bytes.
pub(crate) const WORD_BYTES: usize = 4;

/// Payload alignment guaranteed to callers.
pub(crate) const ALIGN_BYTES: usize = 8;

/// Mask selecting the size field of a header.
pub(crate) const SIZE_MASK: u32 = 0x3FFF_FFFF;

const ALLOC_BIT: u32 = 1 << 30;
const PREV_FREE_BIT: u32 = 1 << 31;

/// Smallest payload a real block can have, in words.
pub(crate) const MIN_PAYLOAD_WORDS: u32 = 2;

/// A block, addressed by its header word.
///
/// `Block` is a plain pointer wrapper; copying it copies the address, not
/// the block. All accessors read or write heap memory and are therefore
/// `unsafe`: the caller must guarantee the pointer designates a live block
/// inside the heap (or one of the zero-size sentinel blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    header: *mut u32,
}

impl Block {
    /// Wraps a header word pointer.
    pub(crate) fn from_header(header: *mut u32) -> Self {
        debug_assert!(!header.is_null());
        Self { header }
    }

    /// Recovers the block from the payload pointer handed to a caller.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer previously produced by
    /// [`payload`](Self::payload) on a live allocated block.
    pub(crate) unsafe fn from_payload(payload: *mut u8) -> Self {
        debug_assert!(payload.addr().is_multiple_of(ALIGN_BYTES));
        Self {
            header: unsafe { payload.cast::<u32>().sub(1) },
        }
    }

    pub(crate) fn header_ptr(self) -> *mut u32 {
        self.header
    }

    /// Address of the header word, used for the address ordering of the
    /// per-size sibling lists.
    pub(crate) fn addr(self) -> usize {
        self.header.addr()
    }

    /// Payload pointer returned to callers. Always 8-byte aligned.
    ///
    /// # Safety
    ///
    /// `self` must designate a live block.
    pub(crate) unsafe fn payload(self) -> *mut u8 {
        let payload = unsafe { self.header.add(1) }.cast::<u8>();
        debug_assert!(payload.addr().is_multiple_of(ALIGN_BYTES));
        payload
    }

    /// Payload size in words, excluding header and footer.
    ///
    /// # Safety
    ///
    /// `self` must designate a live block.
    pub(crate) unsafe fn size(self) -> u32 {
        unsafe { self.header.read() & SIZE_MASK }
    }

    /// # Safety
    ///
    /// `self` must designate a live block.
    pub(crate) unsafe fn is_free(self) -> bool {
        unsafe { self.header.read() & ALLOC_BIT == 0 }
    }

    /// Whether the physically preceding block is free.
    ///
    /// # Safety
    ///
    /// `self` must designate a live block.
    pub(crate) unsafe fn prev_is_free(self) -> bool {
        unsafe { self.header.read() & PREV_FREE_BIT != 0 }
    }

    /// Writes a free-block header and mirrors it into the footer.
    ///
    /// # Safety
    ///
    /// `self` must designate a block whose `size + 2` words are owned by the
    /// caller.
    pub(crate) unsafe fn write_free(self, size: u32, prev_free: bool) {
        debug_assert_eq!(size & !SIZE_MASK, 0);
        let header = size | if prev_free { PREV_FREE_BIT } else { 0 };
        unsafe {
            self.header.write(header);
            self.header.add(size as usize + 1).write(header);
        }
    }

    /// Writes an allocated-block header. No footer is written; the
    /// successor's prev-free bit is the only record of this block's state.
    ///
    /// # Safety
    ///
    /// `self` must designate a block whose `size + 1` words are owned by the
    /// caller.
    pub(crate) unsafe fn write_alloc(self, size: u32, prev_free: bool) {
        debug_assert_eq!(size & !SIZE_MASK, 0);
        let header = size | ALLOC_BIT | if prev_free { PREV_FREE_BIT } else { 0 };
        unsafe { self.header.write(header) }
    }

    /// Flips only the prev-free bit, leaving size and alloc state alone.
    ///
    /// Header-only on purpose: the one caller that targets a still-free
    /// successor immediately coalesces it away, footer and all.
    ///
    /// # Safety
    ///
    /// `self` must designate a live block.
    pub(crate) unsafe fn set_prev_free(self, prev_free: bool) {
        unsafe {
            let header = self.header.read();
            let header = if prev_free {
                header | PREV_FREE_BIT
            } else {
                header & !PREV_FREE_BIT
            };
            self.header.write(header);
        }
    }

    /// The physically next block. For the last real block this is the
    /// epilogue sentinel.
    ///
    /// # Safety
    ///
    /// `self` must designate a live block other than the epilogue.
    pub(crate) unsafe fn next(self) -> Block {
        let words = unsafe { 1 + self.size() as usize + usize::from(self.is_free()) };
        Block::from_header(unsafe { self.header.add(words) })
    }

    /// The physically previous block, located through its footer.
    ///
    /// # Safety
    ///
    /// `self` must designate a live block whose predecessor is free
    /// ([`prev_is_free`](Self::prev_is_free) holds); allocated predecessors
    /// have no footer to read.
    pub(crate) unsafe fn prev(self) -> Block {
        debug_assert!(unsafe { self.prev_is_free() });
        let prev_size = unsafe { self.header.sub(1).read() & SIZE_MASK };
        Block::from_header(unsafe { self.header.sub(prev_size as usize + 2) })
    }

    /// Reads payload word `index` (1-based from the header), used by the
    /// free index for its link fields.
    ///
    /// # Safety
    ///
    /// `self` must designate a live free block with at least `index` payload
    /// words.
    pub(crate) unsafe fn payload_word(self, index: usize) -> u32 {
        debug_assert!(index >= 1 && index as u32 <= unsafe { self.size() });
        unsafe { self.header.add(index).read() }
    }

    /// Writes payload word `index` (1-based from the header).
    ///
    /// # Safety
    ///
    /// Same requirements as [`payload_word`](Self::payload_word).
    pub(crate) unsafe fn set_payload_word(self, index: usize, value: u32) {
        debug_assert!(index >= 1 && index as u32 <= unsafe { self.size() });
        unsafe { self.header.add(index).write(value) }
    }

    /// Whether the footer mirrors the header. Only meaningful on free
    /// blocks; used by the heap checker.
    ///
    /// # Safety
    ///
    /// `self` must designate a live free block.
    pub(crate) unsafe fn footer_matches(self) -> bool {
        unsafe {
            let header = self.header.read();
            let footer = self.header.add(self.size() as usize + 1).read();
            header == footer
        }
    }
}
