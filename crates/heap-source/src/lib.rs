//! Grow-only heap region primitives.
//!
//! An allocator built on this crate never maps or unmaps memory itself.
//! Instead it asks a [`HeapSource`] for more bytes and receives a pointer to
//! the start of the freshly granted range. The source models a classic
//! `sbrk`-style program break:
//!
//! - the region starts empty and only ever grows,
//! - consecutive grants are physically contiguous,
//! - nothing is ever returned to the source.
//!
//! ```text
//!   lo()                                  hi()
//!    ┌──────────────────────────────────────┐
//!    │            granted bytes             │   unreachable capacity
//!    └──────────────────────────────────────┘
//!                                            ▲
//!                                            └── next sbrk() grant starts here
//! ```
//!
//! The one implementation provided here, [`ArenaSource`], serves a region of
//! caller-provided memory with a fixed capacity. Exhausting it makes
//! [`sbrk`](HeapSource::sbrk) fail deterministically, which is exactly what
//! out-of-memory tests need.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::ptr::NonNull;

use snafu::{Snafu, ensure};

/// Granularity of every grant, in bytes.
///
/// Grants are multiples of a double word so that a source never has to shim
/// alignment: if the region starts 8-byte aligned, every grant does too.
pub const GRANULE: usize = 8;

/// Error returned when a [`HeapSource`] cannot grant a request.
#[derive(Debug, Snafu)]
pub enum SbrkError {
    /// The backing region has no room left for the request.
    #[snafu(display(
        "heap source exhausted: requested {requested} bytes with {remaining} remaining"
    ))]
    Exhausted {
        /// Bytes asked for.
        requested: usize,
        /// Bytes the source could still have granted.
        remaining: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The request is not a multiple of [`GRANULE`].
    #[snafu(display("sbrk request of {bytes} bytes is not a multiple of {GRANULE}"))]
    Misaligned {
        /// Bytes asked for.
        bytes: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// A contiguous, grow-only memory region handed out one grant at a time.
///
/// Implementations must uphold, for every value of `Self`:
///
/// - a successful `sbrk(n)` extends the region by exactly `n` bytes and
///   returns a pointer to the first of them,
/// - grants are contiguous: the pointer returned by one successful call is
///   one past the last byte of the previous grant,
/// - a failed `sbrk` leaves the region untouched,
/// - every granted byte stays valid for reads and writes until the source is
///   dropped, and the whole granted range is addressable through the pointer
///   returned by [`lo`](Self::lo).
pub trait HeapSource {
    /// Grows the region by `bytes` (a multiple of [`GRANULE`]) and returns
    /// the start of the new range.
    ///
    /// # Errors
    ///
    /// [`SbrkError::Exhausted`] if the source cannot grow any further,
    /// [`SbrkError::Misaligned`] if `bytes` is not a multiple of
    /// [`GRANULE`]. Either way the region is unchanged.
    fn sbrk(&mut self, bytes: usize) -> Result<NonNull<u8>, SbrkError>;

    /// First byte of the region.
    fn lo(&self) -> *mut u8;

    /// Last granted byte of the region.
    ///
    /// Meaningless while [`size`](Self::size) is zero.
    fn hi(&self) -> *mut u8;

    /// Current region length in bytes.
    fn size(&self) -> usize;
}

/// A [`HeapSource`] serving a fixed-capacity region of caller-provided
/// memory.
///
/// The arena does not own its backing memory; the caller keeps it alive and
/// exclusive for as long as the arena (and anything allocating out of it)
/// is in use.
pub struct ArenaSource {
    start: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

// The raw pointer is only a region handle; the arena itself carries no
// thread affinity.
unsafe impl Send for ArenaSource {}

impl ArenaSource {
    /// Creates an arena over `capacity` bytes starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is null or not 8-byte aligned.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the memory range `start..start + capacity` is valid for reads and
    ///   writes,
    /// - the range is not used by anything else while the arena (or an
    ///   allocator drawing from it) is alive,
    /// - the range remains valid for the lifetime of the arena.
    pub unsafe fn new(start: *mut u8, capacity: usize) -> Self {
        let start = NonNull::new(start).expect("arena start must not be null");
        assert!(
            start.as_ptr().addr().is_multiple_of(GRANULE),
            "arena start must be {GRANULE}-byte aligned"
        );
        Self {
            start,
            capacity,
            brk: 0,
        }
    }

    /// Bytes this arena can still grant.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

impl HeapSource for ArenaSource {
    fn sbrk(&mut self, bytes: usize) -> Result<NonNull<u8>, SbrkError> {
        ensure!(bytes.is_multiple_of(GRANULE), MisalignedSnafu { bytes });
        ensure!(
            bytes <= self.remaining(),
            ExhaustedSnafu {
                requested: bytes,
                remaining: self.remaining(),
            }
        );

        // Deriving every grant from `start` keeps the whole region reachable
        // through any one grant, which block-walking allocators rely on.
        let grant = unsafe { self.start.add(self.brk) };
        self.brk += bytes;
        Ok(grant)
    }

    fn lo(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    fn hi(&self) -> *mut u8 {
        debug_assert!(self.brk > 0, "empty region has no last byte");
        unsafe { self.start.add(self.brk - 1).as_ptr() }
    }

    fn size(&self) -> usize {
        self.brk
    }
}
