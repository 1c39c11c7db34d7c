//! In-place free-chunk headers.
//!
//! A free range of heap memory describes itself: its first 16 bytes hold the
//! range's byte length and the address of the next free chunk in the same
//! bin. There is no side table — the chunk *is* the memory it describes.
//! A header is valid only while the range is free; the instant the range is
//! handed out or reformatted, any prior view over it must not be read again.
//!
//! ```text
//!   [0..8)   size  (u64)  — byte length of the free range
//!                           debug builds keep a canary in the top byte
//!   [8..16)  next  (u64)  — address of the next free chunk, 0 = none,
//!                           usize::MAX = dark-matter dead marker
//! ```
//!
//! All chunk addresses and sizes are word (8-byte) multiples, so the plain
//! aligned u64 accesses below are sound.

use std::ptr::NonNull;

/// Machine word. Allocation sizes are rounded up to this.
pub(crate) const WORD_SIZE: usize = 8;

/// Size of the in-place header, and the smallest range that can carry one.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Smallest formatted cell the surrounding runtime deals in. Doubles as the
/// first-fit headroom: a chunk is only split if what remains past the request
/// could hold at least one more cell.
pub const MIN_OBJECT_SIZE: usize = 16;

/// `next` value marking a dead (dark matter) range. Never a valid address.
const DARK_NEXT: u64 = u64::MAX;

/// 8-bit canary kept in the top byte of every chunk's size word.
/// Checked on every header read to catch stale-view corruption.
/// Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
const CHUNK_CANARY: u64 = 0xC5;

#[cfg(debug_assertions)]
const SIZE_MASK: u64 = (1u64 << 56) - 1;

/// Namespace for raw header operations, in the style of a static helper
/// class. All methods are `unsafe`: the caller must guarantee `chunk` points
/// at a committed, word-aligned, currently-free range of at least
/// [`CHUNK_HEADER_SIZE`] bytes that this code is allowed to interpret.
pub struct FreeChunk;

impl FreeChunk {
    #[inline]
    unsafe fn size_word(chunk: NonNull<u8>) -> *mut u64 {
        chunk.as_ptr().cast::<u64>()
    }

    #[inline]
    unsafe fn next_word(chunk: NonNull<u8>) -> *mut u64 {
        // Safety: caller guarantees at least CHUNK_HEADER_SIZE bytes.
        unsafe { chunk.as_ptr().add(WORD_SIZE).cast::<u64>() }
    }

    /// Format `chunk` as a free chunk of `size` bytes with no successor.
    ///
    /// # Safety
    /// `chunk` must point at a committed, word-aligned free range of at least
    /// `size >= CHUNK_HEADER_SIZE` bytes with no other live view over it.
    #[inline]
    pub unsafe fn format(chunk: NonNull<u8>, size: usize) {
        // Safety: upheld by caller.
        unsafe { Self::format_linked(chunk, size, None) }
    }

    /// Format `chunk` and link it to `next` in one go (TLAB chaining).
    ///
    /// # Safety
    /// Same as [`format`](Self::format).
    #[inline]
    pub unsafe fn format_linked(chunk: NonNull<u8>, size: usize, next: Option<NonNull<u8>>) {
        debug_assert!(size >= CHUNK_HEADER_SIZE, "chunk of {size} bytes cannot carry a header");
        debug_assert_eq!(size % WORD_SIZE, 0, "chunk size {size} is not word-aligned");
        debug_assert_eq!(chunk.as_ptr() as usize % WORD_SIZE, 0, "chunk address is not word-aligned");
        let mut word = size as u64;
        #[cfg(debug_assertions)]
        {
            word |= CHUNK_CANARY << 56;
        }
        // Safety: upheld by caller.
        unsafe {
            Self::size_word(chunk).write(word);
            Self::next_word(chunk).write(next.map_or(0, |p| p.as_ptr() as u64));
        }
    }

    /// Byte length of the free range starting at `chunk`.
    ///
    /// # Safety
    /// `chunk` must be a currently formatted free chunk.
    #[inline]
    pub unsafe fn size(chunk: NonNull<u8>) -> usize {
        // Safety: upheld by caller.
        let word = unsafe { Self::size_word(chunk).read() };
        #[cfg(debug_assertions)]
        {
            let canary = word >> 56;
            assert!(
                canary == CHUNK_CANARY,
                "free chunk corruption at {:p}: size-word canary was 0x{canary:02x}, expected 0x{CHUNK_CANARY:02x}",
                chunk.as_ptr(),
            );
            return (word & SIZE_MASK) as usize;
        }
        #[cfg(not(debug_assertions))]
        {
            word as usize
        }
    }

    /// Shrink or grow the recorded length without touching the link.
    ///
    /// # Safety
    /// `chunk` must be a currently formatted free chunk and `size` must still
    /// describe memory the chunk owns.
    #[inline]
    pub unsafe fn set_size(chunk: NonNull<u8>, size: usize) {
        debug_assert!(size >= CHUNK_HEADER_SIZE);
        let mut word = size as u64;
        #[cfg(debug_assertions)]
        {
            word |= CHUNK_CANARY << 56;
        }
        // Safety: upheld by caller.
        unsafe { Self::size_word(chunk).write(word) };
    }

    /// Successor of `chunk` in its free list, if any.
    ///
    /// # Safety
    /// `chunk` must be a currently formatted free chunk.
    #[inline]
    pub unsafe fn next(chunk: NonNull<u8>) -> Option<NonNull<u8>> {
        // Safety: upheld by caller.
        let raw = unsafe { Self::next_word(chunk).read() };
        debug_assert_ne!(raw, DARK_NEXT, "walked into a dark-matter range at {:p}", chunk.as_ptr());
        NonNull::new(raw as usize as *mut u8)
    }

    /// Relink `chunk` to `next` (or terminate the list with `None`).
    ///
    /// # Safety
    /// `chunk` must be a currently formatted free chunk.
    #[inline]
    pub unsafe fn set_next(chunk: NonNull<u8>, next: Option<NonNull<u8>>) {
        // Safety: upheld by caller.
        unsafe { Self::next_word(chunk).write(next.map_or(0, |p| p.as_ptr() as u64)) };
    }

    /// Mark `range` as dark matter: dead, unreclaimable, never tracked again.
    ///
    /// Ranges big enough for a header get one (with the dead marker in the
    /// link word) so heap walkers can step over them; anything smaller is
    /// left as raw bytes — it cannot carry a header and no list will ever
    /// point at it.
    ///
    /// # Safety
    /// `range` must point at committed, word-aligned memory of `size` bytes
    /// owned by the caller.
    #[inline]
    pub unsafe fn format_dark(range: NonNull<u8>, size: usize) {
        if size < CHUNK_HEADER_SIZE {
            return;
        }
        let mut word = size as u64;
        #[cfg(debug_assertions)]
        {
            word |= CHUNK_CANARY << 56;
        }
        // Safety: upheld by caller.
        unsafe {
            Self::size_word(range).write(word);
            Self::next_word(range).write(DARK_NEXT);
        }
    }

    /// Whether the header at `chunk` carries the dark-matter dead marker.
    ///
    /// # Safety
    /// `chunk` must point at a formatted chunk or dark-matter header.
    #[inline]
    pub unsafe fn is_dark(chunk: NonNull<u8>) -> bool {
        // Safety: upheld by caller.
        unsafe { Self::next_word(chunk).read() == DARK_NEXT }
    }
}
