//! Size-class free lists.
//!
//! A bin is an intrusive singly linked list of free chunks sharing a size
//! class, threaded through the chunks' own headers. During a sweep, chunks
//! are appended in the address order the sweeper discovers them — not needed
//! for correctness, but it keeps list dumps readable when debugging.

use super::chunk::FreeChunk;
use std::ptr::NonNull;

pub(crate) struct FreeSpaceList {
    pub(crate) head: Option<NonNull<u8>>,
    pub(crate) last: Option<NonNull<u8>>,
    pub(crate) total_size: usize,
    pub(crate) total_chunks: usize,
    pub(crate) bin_index: usize,
}

// Safety: the list only stores addresses into the heap region its manager
// owns; all access is serialised by the manager's mutex.
unsafe impl Send for FreeSpaceList {}

impl FreeSpaceList {
    pub fn new(bin_index: usize) -> Self {
        Self {
            head: None,
            last: None,
            total_size: 0,
            total_chunks: 0,
            bin_index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn reset(&mut self) {
        self.head = None;
        self.last = None;
        self.total_size = 0;
        self.total_chunks = 0;
    }

    /// Format `chunk` as a `size`-byte free chunk and link it at the tail.
    ///
    /// # Safety
    /// `chunk` must point at a committed, word-aligned free range of `size`
    /// bytes that no list currently tracks.
    pub unsafe fn append(&mut self, chunk: NonNull<u8>, size: usize) {
        // Safety: upheld by caller.
        unsafe {
            FreeChunk::format(chunk, size);
            if let Some(last) = self.last {
                FreeChunk::set_next(last, Some(chunk));
            } else {
                self.head = Some(chunk);
            }
        }
        self.last = Some(chunk);
        self.total_size += size;
        self.total_chunks += 1;
    }

    /// O(1) unlink of `chunk`, whose predecessor is `prev` (`None` for the
    /// head). The chunk's own link is cleared.
    ///
    /// # Safety
    /// `chunk` must be a member of this list and `prev` its predecessor.
    pub unsafe fn remove_after(&mut self, prev: Option<NonNull<u8>>, chunk: NonNull<u8>, size: usize) {
        self.total_chunks -= 1;
        self.total_size -= size;
        // Safety: upheld by caller.
        unsafe {
            let next = FreeChunk::next(chunk);
            match prev {
                None => self.head = next,
                Some(prev) => FreeChunk::set_next(prev, next),
            }
            FreeChunk::set_next(chunk, None);
        }
        if self.last == Some(chunk) {
            self.last = prev;
        }
        debug_assert!(
            self.total_chunks != 0
                || (self.total_size == 0 && self.head.is_none() && self.last.is_none()),
            "inconsistent free list state in bin {}",
            self.bin_index
        );
    }

    /// Read-only first-fit predicate: could some chunk in this list satisfy
    /// a request of `size` bytes given `headroom` extra for a split remnant?
    ///
    /// # Safety
    /// Every chunk in the list must still be validly formatted.
    pub unsafe fn can_fit(&self, size: usize, headroom: usize) -> bool {
        let mut cur = self.head;
        while let Some(chunk) = cur {
            // Safety: list members are formatted chunks.
            let chunk_size = unsafe { FreeChunk::size(chunk) };
            if chunk_size >= size + headroom || chunk_size == size {
                return true;
            }
            // Safety: list members are formatted chunks.
            cur = unsafe { FreeChunk::next(chunk) };
        }
        false
    }

    /// Greedily unlink chunks from the head until the accumulated size meets
    /// `size` or the list runs out. The run stays chained through `next`
    /// (the last taken chunk's link is cleared) and may overshoot the request
    /// by up to one chunk.
    ///
    /// Returns the run head, the bytes taken, and the number of chunks taken.
    ///
    /// # Safety
    /// The list must be non-empty and every member validly formatted.
    pub unsafe fn allocate_chunks(&mut self, size: usize) -> (NonNull<u8>, usize, usize) {
        let head = self.head.expect("allocate_chunks on an empty free list");
        let mut last_taken = head;
        // Safety: list members are formatted chunks.
        let mut taken = unsafe { FreeChunk::size(last_taken) };
        let mut num_taken = 1usize;
        while taken < size {
            // Safety: list members are formatted chunks.
            let Some(next) = (unsafe { FreeChunk::next(last_taken) }) else {
                break;
            };
            last_taken = next;
            // Safety: list members are formatted chunks.
            taken += unsafe { FreeChunk::size(last_taken) };
            num_taken += 1;
        }
        // Safety: last_taken is a formatted chunk; detaching the prefix run.
        unsafe {
            self.head = FreeChunk::next(last_taken);
            FreeChunk::set_next(last_taken, None);
        }
        self.total_chunks -= num_taken;
        self.total_size -= taken;
        if self.last == Some(last_taken) {
            debug_assert_eq!(self.total_chunks, 0, "tail taken but chunks remain");
            self.last = None;
        }
        (head, taken, num_taken)
    }

    /// Detach the entire list as one chained run.
    /// Returns `(head, total_size, total_chunks)` or `None` if empty.
    pub fn take_all(&mut self) -> Option<(NonNull<u8>, usize, usize)> {
        let head = self.head.take()?;
        let size = self.total_size;
        let chunks = self.total_chunks;
        self.reset();
        Some((head, size, chunks))
    }

    /// Walk the list, calling `f` with each chunk and its size.
    ///
    /// # Safety
    /// Every chunk in the list must still be validly formatted.
    pub unsafe fn for_each(&self, mut f: impl FnMut(NonNull<u8>, usize)) {
        let mut cur = self.head;
        while let Some(chunk) = cur {
            // Safety: list members are formatted chunks.
            unsafe {
                f(chunk, FreeChunk::size(chunk));
                cur = FreeChunk::next(chunk);
            }
        }
    }
}
