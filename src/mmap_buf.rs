//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    ptr,
    slice,
    ops::{Drop, Deref, DerefMut},
};
use nix::sys::mman::{mmap, mprotect, madvise, munmap, mlock, munlock, ProtFlags, MapFlags, MmapAdvise};
use core::ffi::c_void;
use crate::util::PAGE_SIZE;

/// `MmapBuf` is semantically a `Vec<u8>` backed by an mmap region, fully committed on creation.
/// Used by the I/O buffer pool (C2), where every buffer is touched immediately by the read it
/// backs, so there is no benefit to a lazier reserve/commit split.
///
/// We don't use the `memmap2` crate because it doesn't offer a len+capacity abstraction. We'd
/// have to wrap its `MmapMut` type, and that doesn't buy us much code reuse.
pub struct MmapBuf {
    addr: ptr::NonNull<u8>,
    len: usize,
    capacity: usize,
}

#[allow(clippy::len_without_is_empty)]
impl MmapBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        unsafe {
            let addr = mmap(
                None,
                std::num::NonZeroUsize::new(capacity).expect("zero-sized MmapBuf"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                None::<std::os::fd::BorrowedFd>,
                0,
            ).expect("mmap() failed") as *mut u8;
            let addr = ptr::NonNull::new_unchecked(addr);
            Self { addr, len: 0, capacity }
        }
    }

    pub fn resize(&mut self, len: usize) {
        assert!(len <= self.capacity);
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }
}

impl Deref for MmapBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }
}

impl DerefMut for MmapBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }
}

impl Drop for MmapBuf {
    fn drop(&mut self) {
        unsafe {
            munmap(self.addr.as_ptr() as *mut c_void, self.capacity).expect("munmap() failed");
        }
    }
}

/// Attempts to lock `addr[0..len)` into physical memory. Pinning is best-effort: on failure we
/// log and carry on, matching the non-fatal pin semantics the buffer pool (C2) requires.
pub fn try_pin(addr: *mut u8, len: usize) -> bool {
    match unsafe { mlock(addr as *const c_void, len) } {
        Ok(()) => true,
        Err(e) => {
            log::warn!("failed to pin {} bytes of I/O buffer pool memory: {}", len, e);
            false
        }
    }
}

pub fn unpin(addr: *mut u8, len: usize) {
    let _ = unsafe { munlock(addr as *const c_void, len) };
}

/// `VmRegion` is a reserve-then-commit virtual address range, modeling the `VirtualAlloc`
/// (`MEM_RESERVE` / `MEM_COMMIT` / `MEM_DECOMMIT`) idiom that the image memory subsystem (C6)
/// is built around, expressed with POSIX primitives:
///
/// * reserve: `mmap(PROT_NONE)` over the whole range, so the address space is claimed but no
///   page table entries are created.
/// * commit: `mprotect(PROT_READ | PROT_WRITE)` over a page-aligned sub-range.
/// * decommit: `madvise(MADV_DONTNEED)` to drop the physical pages, followed by
///   `mprotect(PROT_NONE)` so that accidental reads after eviction fault immediately rather than
///   silently returning zeroed pages.
///
/// This generalizes `MmapBuf`'s single eager-commit mapping to the per-element commit
/// granularity that image memory requires (§4.6).
#[derive(Debug)]
pub struct VmRegion {
    addr: ptr::NonNull<u8>,
    reserved: usize,
}

// SAFETY: the region is only ever read/written through explicit offset+len accessors; callers
// are responsible for not aliasing commit/decommit calls across threads without synchronization,
// exactly as with any other raw memory region confined to a single driver tick.
unsafe impl Send for VmRegion {}

impl VmRegion {
    /// Reserves `reserved` bytes of address space. The caller rounds `reserved` up to a page
    /// multiple ahead of time (§4.6: element stride is always a page-size multiple).
    pub fn reserve(reserved: usize) -> Self {
        assert!(reserved > 0);
        unsafe {
            let addr = mmap(
                None,
                std::num::NonZeroUsize::new(reserved).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                None::<std::os::fd::BorrowedFd>,
                0,
            ).expect("mmap(PROT_NONE) reservation failed") as *mut u8;
            let addr = ptr::NonNull::new_unchecked(addr);
            Self { addr, reserved }
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Commits `[offset, offset+len)`. Both must already be page-aligned by the caller (§4.6:
    /// `bytes_committed` is always a page multiple). Returns the `mprotect` error on failure so
    /// callers (image memory's `lock_element`/`lock_level`) can report `CommitFailed` instead of
    /// unwinding the driver tick.
    pub fn commit(&mut self, offset: usize, len: usize) -> nix::Result<()> {
        if len == 0 {
            return Ok(());
        }
        debug_assert_eq!(offset % *PAGE_SIZE, 0);
        debug_assert_eq!(len % *PAGE_SIZE, 0);
        assert!(offset + len <= self.reserved);
        unsafe {
            let p = self.addr.as_ptr().add(offset) as *mut c_void;
            mprotect(p, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        }
    }

    /// Decommits `[offset, offset+len)`: drops the backing pages and forbids access until the
    /// next `commit()` of an overlapping range.
    pub fn decommit(&mut self, offset: usize, len: usize) -> nix::Result<()> {
        if len == 0 {
            return Ok(());
        }
        debug_assert_eq!(offset % *PAGE_SIZE, 0);
        debug_assert_eq!(len % *PAGE_SIZE, 0);
        assert!(offset + len <= self.reserved);
        unsafe {
            let p = self.addr.as_ptr().add(offset) as *mut c_void;
            let _ = madvise(p, len, MmapAdvise::MADV_DONTNEED);
            mprotect(p, len, ProtFlags::PROT_NONE)
        }
    }

    /// Returns a mutable byte slice over a sub-range.
    ///
    /// # Safety
    /// `[offset, offset+len)` must lie within a previously committed range.
    pub unsafe fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.reserved);
        slice::from_raw_parts_mut(self.addr.as_ptr().add(offset), len)
    }

    /// # Safety
    /// `[offset, offset+len)` must lie within a previously committed range.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.reserved);
        slice::from_raw_parts(self.addr.as_ptr().add(offset), len)
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr() as *mut c_void, self.reserved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_then_decommit_roundtrips() {
        let page = *PAGE_SIZE;
        let mut region = VmRegion::reserve(4 * page);
        region.commit(0, page).unwrap();
        unsafe {
            let s = region.slice_mut(0, page);
            s[0] = 42;
            assert_eq!(s[0], 42);
        }
        region.decommit(0, page).unwrap();
        region.commit(0, page).unwrap();
        // After a fresh commit, POSIX guarantees zero-filled anonymous pages.
        unsafe {
            assert_eq!(region.slice(0, page)[0], 0);
        }
    }

    #[test]
    fn mmap_buf_resize_is_bounded() {
        let mut buf = MmapBuf::with_capacity(*PAGE_SIZE);
        buf.resize(10);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.capacity(), *PAGE_SIZE);
    }
}
