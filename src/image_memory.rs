//! Image memory (C6, §4.6): a reservation-based virtual-memory store for decoded pixel data. Each
//! image reserves `element_count * round_up(element_bytes, page_size)` bytes of address space up
//! front and commits/decommits per element on demand, so a cache holding thousands of declared
//! images pays no physical memory for the ones nothing has touched.
//!
//! Built on [`VmRegion`](crate::mmap_buf::VmRegion), which does the actual
//! reserve/commit/decommit syscalls; this module adds the per-element bookkeeping (lock counts,
//! level tables, the streaming write cursor) that the spec's element status word and write-path
//! invariants describe.

use std::collections::HashMap;
use crate::{
    error::MemoryError,
    mmap_buf::VmRegion,
    queues::MpscProducer,
    types::{Compression, ElementFlags, Encoding, FrameIndex, ImageId, LevelIndex, PixelFormat},
    util::{round_up, PAGE_SIZE},
};

/// Static shape of an image, fixed at `reserve_image` time (§4.6, §3). Re-reserving an existing
/// `ImageId` with a different definition is a `MemoryError::AlreadyExists`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDef {
    pub width: u32,
    pub height: u32,
    pub element_count: u32,
    pub level_count: u32,
    pub element_bytes: usize,
    pub compression: Compression,
    pub format: PixelFormat,
}

/// Offset and size of one decoded mip level within its element's committed range, recorded by
/// `mark_level_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelEntry {
    pub offset: usize,
    pub size: usize,
}

/// The element status word (§4.6): a lock count plus the `COMMITTED` / `EVICT` / `DROP` flags.
/// The spec packs these into a single 32-bit word (low 16 bits lock count, high 16 bits flags);
/// we keep them as two plain fields rather than hand-rolling bit-packing Rust has no need for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementStatus {
    pub lock_count: u16,
    pub flags: ElementFlags,
}

#[derive(Debug)]
struct ElementState {
    status: ElementStatus,
    /// Bytes of this element's stride currently backed by real pages.
    committed_bytes: usize,
    /// Write cursor: bytes written so far via the streaming write path.
    bytes_used: usize,
    /// Running offset for `mark_level_end`, reset by `reset_element_storage`.
    level_cursor: usize,
    levels: Vec<LevelEntry>,
}

impl ElementState {
    fn new(level_count: u32) -> Self {
        Self {
            status: ElementStatus::default(),
            committed_bytes: 0,
            bytes_used: 0,
            level_cursor: 0,
            levels: vec![LevelEntry::default(); level_count as usize],
        }
    }
}

struct ImageEntry {
    def: ImageDef,
    encoding: Encoding,
    region: VmRegion,
    /// `round_up(element_bytes, page_size)`: the per-element reservation stride.
    stride: usize,
    elements: Vec<ElementState>,
    /// Set by `drop_image`; the reservation is released once every element decommits.
    dropping: bool,
}

impl ImageEntry {
    fn base_ptr(&self, index: usize) -> *mut u8 {
        unsafe { self.region.base().add(index * self.stride) }
    }

    /// Commits the element's full stride if not already committed: `lock_element` and
    /// `lock_level` both need the element's backing pages present to read through them.
    fn ensure_committed(&mut self, index: usize) -> Result<(), MemoryError> {
        if self.elements[index].status.flags.contains(ElementFlags::COMMITTED) {
            return Ok(());
        }
        let stride = self.stride;
        self.region.commit(index * stride, stride).map_err(|_| MemoryError::CommitFailed)?;
        let state = &mut self.elements[index];
        state.status.flags.insert(ElementFlags::COMMITTED);
        state.committed_bytes = stride;
        Ok(())
    }

    fn decommit_element(&mut self, index: usize) -> Result<(), MemoryError> {
        let stride = self.stride;
        if self.elements[index].status.flags.contains(ElementFlags::COMMITTED) {
            self.region.decommit(index * stride, stride).map_err(|_| MemoryError::CommitFailed)?;
        }
        let state = &mut self.elements[index];
        state.status.flags.remove(ElementFlags::COMMITTED | ElementFlags::EVICT);
        state.committed_bytes = 0;
        state.bytes_used = 0;
        state.level_cursor = 0;
        for level in &mut state.levels {
            *level = LevelEntry::default();
        }
        Ok(())
    }

    fn all_decommitted(&self) -> bool {
        self.elements.iter().all(|e| !e.status.flags.contains(ElementFlags::COMMITTED))
    }
}

/// A location notification (§4.6): emitted by `mark_element_end` when a level's committed bytes
/// become visible to the cache, so it can advertise the element's base address downstream.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub image: ImageId,
    pub element: FrameIndex,
    pub base_address: *const u8,
    pub bytes_committed: usize,
}

// SAFETY: `base_address` is a raw pointer into a `VmRegion` committed range. The region outlives
// every `Location` built from it for the lifetime of the image (never freed while elements remain
// committed), and the pointer is read-only from the consumer's perspective.
unsafe impl Send for Location {}

/// Per-image reservation store (§4.6). Owns every image's `VmRegion` and per-element bookkeeping;
/// there is one `ImageMemory` per cache instance.
#[derive(Debug)]
pub struct ImageMemory {
    images: HashMap<ImageId, ImageEntry>,
    locations: Option<MpscProducer<Location>>,
}

impl ImageMemory {
    pub fn new(locations: Option<MpscProducer<Location>>) -> Self {
        Self { images: HashMap::new(), locations }
    }

    /// Creates the image's reservation if absent, or validates that an existing reservation
    /// matches `def`/`encoding` exactly. A mismatch is `MemoryError::AlreadyExists`, matching the
    /// "once a field is set it cannot change" image-definition invariant (§3).
    pub fn reserve_image(&mut self, id: ImageId, def: ImageDef, encoding: Encoding) -> Result<(), MemoryError> {
        if let Some(existing) = self.images.get(&id) {
            return if existing.def == def && existing.encoding == encoding {
                Ok(())
            } else {
                Err(MemoryError::AlreadyExists(id))
            };
        }

        let stride = round_up(def.element_bytes, *PAGE_SIZE);
        let total = stride * def.element_count as usize;
        let region = VmRegion::reserve(total.max(*PAGE_SIZE));
        let elements = (0..def.element_count).map(|_| ElementState::new(def.level_count)).collect();
        self.images.insert(id, ImageEntry { def, encoding, region, stride, elements, dropping: false });
        Ok(())
    }

    fn entry_mut(&mut self, id: ImageId) -> Result<&mut ImageEntry, MemoryError> {
        self.images.get_mut(&id).ok_or(MemoryError::UnknownImage(id))
    }

    fn check_index(entry: &ImageEntry, element: FrameIndex) -> Result<usize, MemoryError> {
        let index = element as usize;
        if index >= entry.elements.len() {
            return Err(MemoryError::OutOfRange);
        }
        Ok(index)
    }

    /// Commits the element if needed and locks it for every level at once, incrementing the lock
    /// count by `level_count` (§4.6). Returns the element's base address and a copy of its level
    /// table.
    pub fn lock_element(&mut self, id: ImageId, element: FrameIndex) -> Result<(*mut u8, Vec<LevelEntry>), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let level_count = entry.def.level_count as u16;
        entry.ensure_committed(index)?;
        let state = &mut entry.elements[index];
        state.status.lock_count = state.status.lock_count.saturating_add(level_count);
        let levels = state.levels.clone();
        Ok((entry.base_ptr(index), levels))
    }

    /// Locks a single level, incrementing the lock count by one.
    pub fn lock_level(&mut self, id: ImageId, element: FrameIndex, level: LevelIndex) -> Result<(*mut u8, LevelEntry), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        entry.ensure_committed(index)?;
        let state = &mut entry.elements[index];
        let level_entry = *state.levels.get(level as usize).ok_or(MemoryError::OutOfRange)?;
        state.status.lock_count = state.status.lock_count.saturating_add(1);
        Ok((entry.base_ptr(index), level_entry))
    }

    /// Decrements the lock count by `level_count`; if it reaches zero while `EVICT` is pending,
    /// decommits immediately.
    pub fn unlock_element(&mut self, id: ImageId, element: FrameIndex) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let level_count = entry.def.level_count as u16;
        self.unlock_by(id, element, level_count)
    }

    pub fn unlock_level(&mut self, id: ImageId, element: FrameIndex) -> Result<(), MemoryError> {
        self.unlock_by(id, element, 1)
    }

    fn unlock_by(&mut self, id: ImageId, element: FrameIndex, count: u16) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let state = &mut entry.elements[index];
        state.status.lock_count = state.status.lock_count.saturating_sub(count);
        if state.status.lock_count == 0 && state.status.flags.contains(ElementFlags::EVICT) {
            entry.decommit_element(index)?;
        }
        self.maybe_release_dropping(id);
        Ok(())
    }

    /// Marks every element of the image `EVICT`, then processes eviction on each (decommitting
    /// those with a zero lock count right away).
    pub fn evict_image(&mut self, id: ImageId) -> Result<(), MemoryError> {
        let count = self.entry_mut(id)?.elements.len();
        for i in 0..count {
            self.evict_element(id, i as FrameIndex)?;
        }
        Ok(())
    }

    pub fn evict_element(&mut self, id: ImageId, element: FrameIndex) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let state = &mut entry.elements[index];
        state.status.flags.insert(ElementFlags::EVICT);
        if state.status.lock_count == 0 {
            entry.decommit_element(index)?;
        }
        self.maybe_release_dropping(id);
        Ok(())
    }

    /// Marks the image `DROP`. With `force`, the reservation is released immediately regardless
    /// of outstanding locks; otherwise every element is marked `EVICT` and the reservation is
    /// released once all elements have decommitted.
    pub fn drop_image(&mut self, id: ImageId, force: bool) -> Result<(), MemoryError> {
        if force {
            self.images.remove(&id).ok_or(MemoryError::UnknownImage(id))?;
            return Ok(());
        }
        {
            let entry = self.entry_mut(id)?;
            entry.dropping = true;
            for state in &mut entry.elements {
                state.status.flags.insert(ElementFlags::DROP | ElementFlags::EVICT);
            }
        }
        self.evict_image(id)
    }

    fn maybe_release_dropping(&mut self, id: ImageId) {
        let release = match self.images.get(&id) {
            Some(entry) => entry.dropping && entry.all_decommitted(),
            None => false,
        };
        if release {
            self.images.remove(&id);
        }
    }

    /// Decommits the element, resetting the write cursor and level table: the first step of the
    /// streaming write path (§4.6).
    pub fn reset_element_storage(&mut self, id: ImageId, element: FrameIndex) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        entry.decommit_element(index)
    }

    /// Grows the element's commit to at least `bytes_used + additional`, rounded up to a page
    /// multiple, maintaining `bytes_used <= bytes_committed <= element_bytes` (§4.6).
    pub fn increase_commit(&mut self, id: ImageId, element: FrameIndex, additional: usize) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let element_bytes = entry.def.element_bytes;
        let stride = entry.stride;
        let state = &entry.elements[index];
        let needed = round_up((state.bytes_used + additional).min(element_bytes), *PAGE_SIZE);
        if needed > state.committed_bytes {
            let grow = needed - state.committed_bytes;
            let grow_offset = index * stride + state.committed_bytes;
            entry.region.commit(grow_offset, grow).map_err(|_| MemoryError::CommitFailed)?;
            let state = &mut entry.elements[index];
            state.committed_bytes = needed;
            state.status.flags.insert(ElementFlags::COMMITTED);
        }
        Ok(())
    }

    /// Writes `data` at the current write cursor, growing the commit first if needed.
    pub fn write(&mut self, id: ImageId, element: FrameIndex, data: &[u8]) -> Result<(), MemoryError> {
        let start = {
            let entry = self.entry_mut(id)?;
            let index = Self::check_index(entry, element)?;
            entry.elements[index].bytes_used
        };
        let end = start + data.len();
        self.increase_commit(id, element, data.len())?;

        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let stride = entry.stride;
        unsafe {
            let dst = entry.region.slice_mut(index * stride, stride);
            dst[start..end].copy_from_slice(data);
        }
        entry.elements[index].bytes_used = end;
        Ok(())
    }

    /// Records `(level_cursor, level_size)` for `level` and advances the cursor past it.
    pub fn mark_level_end(&mut self, id: ImageId, element: FrameIndex, level: LevelIndex, level_size: usize) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let state = &mut entry.elements[index];
        let offset = state.level_cursor;
        let slot = state.levels.get_mut(level as usize).ok_or(MemoryError::OutOfRange)?;
        *slot = LevelEntry { offset, size: level_size };
        state.level_cursor += level_size;
        Ok(())
    }

    /// Trims the element's commit down to the page rounded up from `bytes_used`, and optionally
    /// notifies the cache of the element's now-stable base address and committed size.
    pub fn mark_element_end(&mut self, id: ImageId, element: FrameIndex) -> Result<(), MemoryError> {
        let entry = self.entry_mut(id)?;
        let index = Self::check_index(entry, element)?;
        let stride = entry.stride;
        let state = &entry.elements[index];
        let keep = round_up(state.bytes_used, *PAGE_SIZE).min(stride);
        if keep < state.committed_bytes {
            let trim_offset = index * stride + keep;
            let trim_len = state.committed_bytes - keep;
            entry.region.decommit(trim_offset, trim_len).map_err(|_| MemoryError::CommitFailed)?;
            entry.elements[index].committed_bytes = keep;
        }

        if let Some(locations) = &self.locations {
            let entry = self.images.get(&id).ok_or(MemoryError::UnknownImage(id))?;
            let state = &entry.elements[index];
            locations.produce(Location {
                image: id,
                element,
                base_address: entry.base_ptr(index) as *const u8,
                bytes_committed: state.committed_bytes,
            });
        }
        Ok(())
    }
}
