//! I/O buffer type.
//!
//! An `IoBuffer` is an owned, page-aligned allocation that a read lands in
//! and that the transport later sends from. Ownership moves along the
//! request's life: pool → request record → backend (by raw pointer, while
//! the record keeps the buffer) → transport (on send) → back to the pool
//! once the send is confirmed. Because `release` takes the buffer by value,
//! a buffer cannot be returned twice.
//!
//! Buffers remember where they came from so the pool knows whether to
//! recycle or free them:
//!
//! - `BufferOrigin::Pool { tier }`: one of the pre-sized slab tiers.
//! - `BufferOrigin::Fallback`: an ad hoc allocation made when the tier was
//!   exhausted.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    Pool { tier: u8 },
    Fallback,
}

pub struct IoBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    origin: BufferOrigin,
}

// Safety: the buffer exclusively owns its allocation.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    /// Alignment of every buffer. Matches the page size so buffers are also
    /// usable with O_DIRECT.
    pub const ALIGN: usize = 4096;

    /// Allocate `capacity` bytes. Returns `None` if `capacity` is zero or the
    /// allocator fails.
    pub fn alloc(capacity: usize, origin: BufferOrigin) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let layout = Layout::from_size_align(capacity, Self::ALIGN).ok()?;
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw)?;
        Some(Self {
            ptr,
            capacity,
            len: 0,
            origin,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    pub fn from_pool(&self) -> bool {
        matches!(self.origin, BufferOrigin::Pool { .. })
    }

    /// Zero the first `len` bytes and mark them valid.
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn prepare(&mut self, len: usize) {
        assert!(len <= self.capacity, "prepare({}) beyond capacity {}", len, self.capacity);
        // Safety: in bounds of our allocation.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, len) };
        self.len = len;
    }

    /// Shrink the valid region, e.g. after a short read.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Mark the buffer empty before it goes back to a pool.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: `len <= capacity` and the first `len` bytes were written.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and we hold `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for IoBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("origin", &self.origin)
            .finish()
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        // Safety: same layout as in `alloc`, which already validated it.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, Self::ALIGN);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}
