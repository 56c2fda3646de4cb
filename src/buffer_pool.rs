//! I/O buffer pool (C2, §4.2): page-aligned, pinned, fixed-size buffers suitable for unbuffered
//! overlapped I/O. Grounded in [`crate::mmap_buf::MmapBuf`]'s anonymous-mapping idiom: one large
//! mapping is reserved and committed up front, then carved into fixed-size, page-aligned slices
//! handed out from a free list.

use crate::mmap_buf::{MmapBuf, try_pin, unpin};
use crate::util::round_up;
use std::sync::Mutex;

/// A single fixed-size, page-aligned buffer handed out by the pool. `ptr`/`len` point into the
/// pool's backing mapping; the pool outlives every buffer it has handed out, so borrowing the
/// raw pointer is sound as long as callers return buffers before the pool is dropped (the same
/// discipline the spec's AIO/decoder/pool ownership chain already requires).
#[derive(Debug, Clone, Copy)]
pub struct BufferHandle {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for BufferHandle {}

impl BufferHandle {
    /// # Safety
    /// The caller must not retain the slice past the buffer's return to the pool.
    pub unsafe fn as_mut_slice(&self) -> &'static mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Inner {
    backing: MmapBuf,
    alloc_size: usize,
    free_list: Vec<*mut u8>,
    pinned: bool,
}

// SAFETY: access to `Inner` is always taken through `IoBufferPool`'s mutex.
unsafe impl Send for Inner {}

/// Reserves `total = round_up(requested_total, alloc_size)` bytes, where
/// `alloc_size = round_up(requested_alloc, PAGE_SIZE)`, commits the whole range at creation, and
/// attempts to pin it in physical memory (non-fatal on failure, per §4.2).
pub struct IoBufferPool {
    inner: Mutex<Inner>,
}

impl IoBufferPool {
    pub fn new(requested_total: usize, requested_alloc: usize) -> Self {
        let page_size = *crate::util::PAGE_SIZE;
        let alloc_size = round_up(requested_alloc, page_size);
        let total = round_up(requested_total, alloc_size);
        let buffer_count = total / alloc_size;

        let mut backing = MmapBuf::with_capacity(total);
        backing.resize(total);

        let pinned = try_pin(backing.as_ptr(), total);

        let base = backing.as_ptr();
        let free_list: Vec<*mut u8> = (0..buffer_count)
            .map(|i| unsafe { base.add(i * alloc_size) })
            .collect();

        log::debug!(
            "I/O buffer pool reserved {} bytes ({} buffers of {} bytes each), pinned={}",
            total, buffer_count, alloc_size, pinned,
        );

        Self { inner: Mutex::new(Inner { backing, alloc_size, free_list, pinned }) }
    }

    /// Pops a buffer from the free list. Returns `None` on exhaustion — per §7 this is
    /// backpressure, not an error, and the caller (PIO) is expected to skip the requesting
    /// stream for the remainder of the tick.
    pub fn get_buffer(&self) -> Option<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        let alloc_size = inner.alloc_size;
        inner.free_list.pop().map(|ptr| BufferHandle { ptr, len: alloc_size })
    }

    /// Returns a previously obtained buffer to the free list.
    pub fn put_buffer(&self, handle: BufferHandle) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(handle.len, inner.alloc_size);
        inner.free_list.push(handle.ptr);
    }

    /// Rebuilds the free list from the base address. Only valid when the caller knows no buffers
    /// are currently in use (§4.2).
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let alloc_size = inner.alloc_size;
        let base = inner.backing.as_ptr();
        let total = inner.backing.len();
        let buffer_count = total / alloc_size;
        inner.free_list = (0..buffer_count).map(|i| unsafe { base.add(i * alloc_size) }).collect();
    }

    pub fn alloc_size(&self) -> usize {
        self.inner.lock().unwrap().alloc_size
    }

    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().free_list.len()
    }

    pub fn is_pinned(&self) -> bool {
        self.inner.lock().unwrap().pinned
    }
}

impl Drop for IoBufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        if inner.pinned {
            unpin(inner.backing.as_ptr(), inner.backing.len());
        }
    }
}
