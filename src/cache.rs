//! Image cache (C10, §4.10): the top-level policy layer. Maintains a read-heavy metadata table,
//! a single-threaded entry table for images with frames actually in cache, a pending-load table
//! for coalescing, and a byte-budget attribute lock. Grounded in `imcache.cc`'s
//! `image_cache_entry_t`/`image_cache_info_t`/`image_cache_command_t` shapes, reinterpreted with
//! `Vec`-of-records instead of parallel arrays and `Option<MpscProducer<_>>` result/error
//! routing instead of raw FIFO pointers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    config::EvictionBehavior,
    error::CacheError,
    image_memory::{ImageMemory, Location},
    loader::{ImageDefinition, LoadRequest},
    parser::DecodePos,
    queues::{MpscProducer, UnboundedMpsc},
    types::{Compression, Encoding, FrameIndex, ImageId, PixelFormat, ALL_FRAMES},
};

/// A declared file range for an image (§4.10 step 1). An image may span several declarations
/// (e.g. one per mip chain stored in a separate file); an incoming declaration equivalent to or
/// subsumed by an existing range is a no-op.
#[derive(Debug, Clone)]
pub struct ImageDeclaration {
    pub image: ImageId,
    pub file_path: String,
    pub first_frame: FrameIndex,
    pub final_frame: FrameIndex,
    pub file_offset: u64,
}

#[derive(Debug, Clone)]
struct FileRange {
    file_path: String,
    first_frame: FrameIndex,
    final_frame: FrameIndex,
    file_offset: u64,
}

impl FileRange {
    fn subsumes(&self, decl: &ImageDeclaration) -> bool {
        if self.file_path != decl.file_path || self.file_offset != decl.file_offset {
            return false;
        }
        if self.first_frame > decl.first_frame {
            return false;
        }
        self.final_frame == ALL_FRAMES || (decl.final_frame != ALL_FRAMES && self.final_frame >= decl.final_frame)
    }
}

/// Which command produced a [`CacheErrorResult`] (§4.10's `image_cache_command_e`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCommandKind {
    Lock,
    Unlock,
    Evict,
    Drop,
}

/// A cache control command (§4.10). `evict_on_unlock` is the original's
/// `IMAGE_CACHE_COMMAND_OPTION_EVICT`, valid only on `Unlock`.
pub struct CacheCommand {
    pub kind: CacheCommandKind,
    pub image: ImageId,
    pub first_frame: FrameIndex,
    pub final_frame: FrameIndex,
    pub evict_on_unlock: bool,
    pub priority: i32,
    pub request_time_ns: u64,
    pub error_queue: Option<MpscProducer<CacheErrorResult>>,
    pub result_queue: Option<MpscProducer<CacheLockResult>>,
}

/// Posted to a lock command's result queue, one per requested frame that is (or becomes) cached
/// (§4.10). Carries full metadata so a client never needs a second query.
#[derive(Debug, Clone, Copy)]
pub struct CacheLockResult {
    pub image: ImageId,
    pub frame: FrameIndex,
    pub format: PixelFormat,
    pub compression: Compression,
    pub encoding: Encoding,
    pub level_count: u32,
    pub base_address: *const u8,
    pub bytes_reserved: usize,
}

// SAFETY: `base_address` is read-only from the consumer's perspective and points into an
// `ImageMemory` region that outlives every outstanding lock built from it (the cache itself
// holds a matching lock against decommit for as long as this result could be read).
unsafe impl Send for CacheLockResult {}

/// Posted to a command's error queue (§4.10); one record per failed request, regardless of range
/// size.
#[derive(Debug, Clone)]
pub struct CacheErrorResult {
    pub command: CacheCommandKind,
    pub image: ImageId,
    pub first_frame: FrameIndex,
    pub final_frame: FrameIndex,
    pub error: CacheError,
}

#[derive(Debug, Clone)]
struct ImageMetadataRecord {
    files: Vec<FileRange>,
    format: PixelFormat,
    compression: Compression,
    encoding: Encoding,
    width: u32,
    height: u32,
    level_count: u32,
    element_count: FrameIndex,
    bytes_per_element: usize,
    block_offsets: Vec<DecodePos>,
}

impl ImageMetadataRecord {
    fn empty() -> Self {
        Self {
            files: Vec::new(),
            format: PixelFormat::Unknown,
            compression: Compression::None,
            encoding: Encoding::Identity,
            width: 0,
            height: 0,
            level_count: 0,
            element_count: 0,
            bytes_per_element: 0,
            block_offsets: Vec::new(),
        }
    }

    fn has_shape(&self) -> bool {
        self.format != PixelFormat::Unknown
    }
}

struct FrameRecord {
    frame: FrameIndex,
    lock_count: u32,
    evict: bool,
    last_request_time_ns: u64,
    time_to_load_ns: u64,
    base_address: *const u8,
    bytes_reserved: usize,
}

struct CacheEntry {
    drop_flag: bool,
    last_request_time_ns: u64,
    frames: Vec<FrameRecord>,
}

impl CacheEntry {
    fn new() -> Self {
        Self { drop_flag: false, last_request_time_ns: 0, frames: Vec::new() }
    }

    fn frame_index(&self, frame: FrameIndex) -> Option<usize> {
        self.frames.iter().position(|f| f.frame == frame)
    }
}

/// One frame a pending load's caller is waiting on (§4.10's load coalescing). Queue sets
/// de-duplicate by target queue identity, not by value, since `MpscProducer` carries no
/// `PartialEq`.
struct FrameWaiter {
    frame: FrameIndex,
    request_time_ns: u64,
    error_queue_ids: Vec<usize>,
    error_queues: Vec<MpscProducer<CacheErrorResult>>,
    result_queue_ids: Vec<usize>,
    result_queues: Vec<MpscProducer<CacheLockResult>>,
}

impl FrameWaiter {
    fn new(frame: FrameIndex, request_time_ns: u64) -> Self {
        Self {
            frame,
            request_time_ns,
            error_queue_ids: Vec::new(),
            error_queues: Vec::new(),
            result_queue_ids: Vec::new(),
            result_queues: Vec::new(),
        }
    }

    fn add_queues(&mut self, error: Option<&MpscProducer<CacheErrorResult>>, result: Option<&MpscProducer<CacheLockResult>>) {
        if let Some(q) = error {
            if !self.error_queue_ids.contains(&q.target_id()) {
                self.error_queue_ids.push(q.target_id());
                self.error_queues.push(q.clone());
            }
        }
        if let Some(q) = result {
            if !self.result_queue_ids.contains(&q.target_id()) {
                self.result_queue_ids.push(q.target_id());
                self.result_queues.push(q.clone());
            }
        }
    }
}

struct PendingLoad {
    waiters: Vec<FrameWaiter>,
}

struct Attrs {
    bytes_limit: u64,
    bytes_used: u64,
    behavior: EvictionBehavior,
}

/// The image cache (C10): top-level policy layer consuming declarations, definitions, locations
/// and commands, and driving the loader on cache misses.
pub struct ImageCache {
    metadata: RwLock<HashMap<ImageId, ImageMetadataRecord>>,
    entries: HashMap<ImageId, CacheEntry>,
    pending: HashMap<ImageId, PendingLoad>,
    attrs: Mutex<Attrs>,

    memory: Arc<Mutex<ImageMemory>>,
    load_requests: MpscProducer<LoadRequest>,
    pixel_pipeline: (Compression, Encoding),

    declarations: UnboundedMpsc<ImageDeclaration>,
    definitions: UnboundedMpsc<ImageDefinition>,
    locations: UnboundedMpsc<Location>,
    commands: UnboundedMpsc<CacheCommand>,
    eviction: UnboundedMpsc<Location>,
}

impl ImageCache {
    pub fn new(
        memory: Arc<Mutex<ImageMemory>>,
        load_requests: MpscProducer<LoadRequest>,
        bytes_limit: u64,
        behavior: EvictionBehavior,
        pixel_pipeline: (Compression, Encoding),
    ) -> Self {
        Self {
            metadata: RwLock::new(HashMap::new()),
            entries: HashMap::new(),
            pending: HashMap::new(),
            attrs: Mutex::new(Attrs { bytes_limit, bytes_used: 0, behavior }),
            memory,
            load_requests,
            pixel_pipeline,
            declarations: UnboundedMpsc::new(),
            definitions: UnboundedMpsc::new(),
            locations: UnboundedMpsc::new(),
            commands: UnboundedMpsc::new(),
            eviction: UnboundedMpsc::new(),
        }
    }

    pub fn declaration_producer(&self) -> MpscProducer<ImageDeclaration> {
        self.declarations.producer()
    }

    pub fn definition_producer(&self) -> MpscProducer<ImageDefinition> {
        self.definitions.producer()
    }

    pub fn location_producer(&self) -> MpscProducer<Location> {
        self.locations.producer()
    }

    pub fn command_producer(&self) -> MpscProducer<CacheCommand> {
        self.commands.producer()
    }

    pub fn eviction_consumer(&self) -> &UnboundedMpsc<Location> {
        &self.eviction
    }

    pub fn bytes_used(&self) -> u64 {
        self.attrs.lock().unwrap().bytes_used
    }

    pub fn set_bytes_limit(&self, limit: u64) {
        self.attrs.lock().unwrap().bytes_limit = limit;
    }

    /// Runs one cache update (§4.10 steps 1-4, in order: declarations, definitions, locations,
    /// commands).
    pub fn update(&mut self) {
        self.drain_declarations();
        self.drain_definitions();
        self.drain_locations();
        self.drain_commands();
    }

    fn drain_declarations(&mut self) {
        let mut batch = Vec::new();
        self.declarations.drain(|d| batch.push(d));
        let mut metadata = self.metadata.write().unwrap();
        for decl in batch {
            let record = metadata.entry(decl.image).or_insert_with(ImageMetadataRecord::empty);
            if record.files.iter().any(|f| f.subsumes(&decl)) {
                continue;
            }
            record.files.push(FileRange {
                file_path: decl.file_path,
                first_frame: decl.first_frame,
                final_frame: decl.final_frame,
                file_offset: decl.file_offset,
            });
        }
    }

    fn drain_definitions(&mut self) {
        let mut batch = Vec::new();
        self.definitions.drain(|d| batch.push(d));
        let mut metadata = self.metadata.write().unwrap();
        for def in batch {
            let record = metadata.entry(def.image).or_insert_with(ImageMetadataRecord::empty);
            if !record.has_shape() {
                record.format = def.format;
                record.compression = def.compression;
                record.encoding = def.encoding;
                record.width = def.width;
                record.height = def.height;
                record.level_count = def.level_count;
                record.bytes_per_element = def.bytes_per_element;
            }
            let new_total = def.element_index + def.element_count;
            if new_total > record.element_count {
                record.element_count = new_total;
            }
            record.block_offsets.extend(def.block_offsets);
        }
    }

    fn drain_locations(&mut self) {
        let mut batch = Vec::new();
        self.locations.drain(|l| batch.push(l));
        for location in batch {
            self.expand_all_frames_waiter(location.image);
            let completed_at = crate::util::Clock::new().now_ns();
            self.complete_waiter(&location, completed_at);

            let entry = self.entries.entry(location.image).or_insert_with(CacheEntry::new);
            let is_new_frame = entry.frame_index(location.element).is_none();
            if is_new_frame {
                entry.frames.push(FrameRecord {
                    frame: location.element,
                    lock_count: 1,
                    evict: false,
                    last_request_time_ns: completed_at,
                    time_to_load_ns: 0,
                    base_address: location.base_address,
                    bytes_reserved: location.bytes_committed,
                });
                let mut attrs = self.attrs.lock().unwrap();
                attrs.bytes_used += location.bytes_committed as u64;
                drop(attrs);
                let _ = self.memory.lock().unwrap().lock_element(location.image, location.element);
            } else if let Some(idx) = entry.frame_index(location.element) {
                entry.frames[idx].base_address = location.base_address;
                entry.frames[idx].bytes_reserved = location.bytes_committed;
            }

            let over_budget = {
                let attrs = self.attrs.lock().unwrap();
                attrs.bytes_used > attrs.bytes_limit
            };
            if over_budget {
                self.apply_eviction_policy();
            }
        }
    }

    /// If metadata for `image` just became known and a waiter was submitted before the element
    /// count was known (an `ALL_FRAMES` pending load), expand it into explicit per-frame waiters
    /// (§4.10 step 3a).
    fn expand_all_frames_waiter(&mut self, image: ImageId) {
        let element_count = match self.metadata.read().unwrap().get(&image) {
            Some(m) if m.element_count > 0 => m.element_count,
            _ => return,
        };
        let Some(pending) = self.pending.get_mut(&image) else { return };
        let Some(pos) = pending.waiters.iter().position(|w| w.frame == ALL_FRAMES) else { return };
        let waiter = pending.waiters.remove(pos);
        for frame in 0..element_count {
            let mut expanded = FrameWaiter::new(frame, waiter.request_time_ns);
            expanded.error_queue_ids = waiter.error_queue_ids.clone();
            expanded.error_queues = waiter.error_queues.clone();
            expanded.result_queue_ids = waiter.result_queue_ids.clone();
            expanded.result_queues = waiter.result_queues.clone();
            pending.waiters.push(expanded);
        }
    }

    fn complete_waiter(&mut self, location: &Location, now_ns: u64) {
        let Some(pending) = self.pending.get_mut(&location.image) else { return };
        let Some(pos) = pending.waiters.iter().position(|w| w.frame == location.element) else { return };
        let waiter = pending.waiters.remove(pos);

        let metadata = self.metadata.read().unwrap();
        let (format, compression, encoding, level_count) = metadata
            .get(&location.image)
            .map(|m| (m.format, m.compression, m.encoding, m.level_count))
            .unwrap_or((PixelFormat::Unknown, Compression::None, Encoding::Identity, 0));
        drop(metadata);

        let time_to_load_ns = now_ns.saturating_sub(waiter.request_time_ns);
        if let Some(entry) = self.entries.get_mut(&location.image) {
            if let Some(idx) = entry.frame_index(location.element) {
                entry.frames[idx].time_to_load_ns = time_to_load_ns;
            }
        }

        for queue in &waiter.result_queues {
            queue.produce(CacheLockResult {
                image: location.image,
                frame: location.element,
                format,
                compression,
                encoding,
                level_count,
                base_address: location.base_address,
                bytes_reserved: location.bytes_committed,
            });
        }

        if pending.waiters.is_empty() {
            self.pending.remove(&location.image);
        }
    }

    fn drain_commands(&mut self) {
        let mut batch = Vec::new();
        self.commands.drain(|c| batch.push(c));
        for command in batch {
            match command.kind {
                CacheCommandKind::Lock => self.handle_lock(command),
                CacheCommandKind::Unlock => self.handle_unlock(command),
                CacheCommandKind::Evict => self.handle_evict(command),
                CacheCommandKind::Drop => self.handle_drop(command),
            }
        }
    }

    fn handle_lock(&mut self, command: CacheCommand) {
        let final_frame = {
            let metadata = self.metadata.read().unwrap();
            let Some(record) = metadata.get(&command.image) else {
                if let Some(q) = &command.error_queue {
                    q.produce(CacheErrorResult {
                        command: CacheCommandKind::Lock,
                        image: command.image,
                        first_frame: command.first_frame,
                        final_frame: command.final_frame,
                        error: CacheError::NotFound(command.image),
                    });
                }
                return;
            };
            if command.final_frame == ALL_FRAMES && record.element_count > 0 {
                record.element_count - 1
            } else {
                command.final_frame
            }
        };

        if final_frame == ALL_FRAMES {
            // Element count still unknown: submit a single ALL_FRAMES pending load (§4.10).
            self.submit_load(command.image, ALL_FRAMES, command.request_time_ns, command.priority,
                command.error_queue.as_ref(), command.result_queue.as_ref());
            return;
        }

        for frame in command.first_frame..=final_frame {
            let cached = self.entries.get_mut(&command.image).and_then(|e| {
                let idx = e.frame_index(frame)?;
                e.last_request_time_ns = command.request_time_ns;
                e.frames[idx].lock_count += 1;
                e.frames[idx].last_request_time_ns = command.request_time_ns;
                Some((e.frames[idx].base_address, e.frames[idx].bytes_reserved))
            });

            if let Some((base_address, bytes_reserved)) = cached {
                let _ = self.memory.lock().unwrap().lock_element(command.image, frame);
                if let Some(q) = &command.result_queue {
                    let metadata = self.metadata.read().unwrap();
                    let record = metadata.get(&command.image).unwrap();
                    q.produce(CacheLockResult {
                        image: command.image,
                        frame,
                        format: record.format,
                        compression: record.compression,
                        encoding: record.encoding,
                        level_count: record.level_count,
                        base_address,
                        bytes_reserved,
                    });
                }
            } else {
                self.submit_load(command.image, frame, command.request_time_ns, command.priority,
                    command.error_queue.as_ref(), command.result_queue.as_ref());
            }
        }
    }

    /// Load coalescing (§4.10): a waiter that already exists for `(image, frame)` just adds its
    /// queues; otherwise a new waiter emits exactly one load request.
    fn submit_load(
        &mut self,
        image: ImageId,
        frame: FrameIndex,
        request_time_ns: u64,
        priority: i32,
        error_queue: Option<&MpscProducer<CacheErrorResult>>,
        result_queue: Option<&MpscProducer<CacheLockResult>>,
    ) {
        let pending = self.pending.entry(image).or_insert_with(|| PendingLoad { waiters: Vec::new() });
        if let Some(waiter) = pending.waiters.iter_mut().find(|w| w.frame == frame) {
            waiter.add_queues(error_queue, result_queue);
            return;
        }
        let mut waiter = FrameWaiter::new(frame, request_time_ns);
        waiter.add_queues(error_queue, result_queue);
        pending.waiters.push(waiter);

        let (file_path, file_offset, metadata_known) = {
            let metadata = self.metadata.read().unwrap();
            match metadata.get(&image).and_then(|m| m.files.first()) {
                Some(f) => (f.file_path.clone(), f.file_offset, metadata.get(&image).map(|m| m.has_shape()).unwrap_or(false)),
                None => (String::new(), 0, false),
            }
        };
        let final_frame = if frame == ALL_FRAMES { ALL_FRAMES } else { frame };
        let _ = priority;
        self.load_requests.produce(LoadRequest {
            image,
            file_path,
            first_frame: if frame == ALL_FRAMES { 0 } else { frame },
            final_frame,
            file_offset,
            metadata_known,
            src: self.pixel_pipeline,
            dst: self.pixel_pipeline,
        });
    }

    fn handle_unlock(&mut self, command: CacheCommand) {
        let entry_has_drop = self.entries.get(&command.image).map(|e| e.drop_flag).unwrap_or(false);
        let force_evict = command.evict_on_unlock || entry_has_drop;

        let Some(entry) = self.entries.get_mut(&command.image) else { return };
        let final_frame = if command.final_frame == ALL_FRAMES {
            entry.frames.last().map(|f| f.frame).unwrap_or(command.first_frame)
        } else {
            command.final_frame
        };

        for frame in command.first_frame..=final_frame {
            if let Some(idx) = entry.frame_index(frame) {
                if force_evict {
                    entry.frames[idx].evict = true;
                }
                if entry.frames[idx].lock_count > 0 {
                    entry.frames[idx].lock_count -= 1;
                    // Mirror the memory-level lock_element() taken on placement/re-lock (§4.6):
                    // evict_element only decommits once ImageMemory's own lock_count is zero.
                    let _ = self.memory.lock().unwrap().unlock_element(command.image, frame);
                }
            }
        }
        self.process_pending_eviction(command.image);
    }

    fn handle_evict(&mut self, command: CacheCommand) {
        if let Some(entry) = self.entries.get_mut(&command.image) {
            let final_frame = if command.final_frame == ALL_FRAMES {
                entry.frames.last().map(|f| f.frame).unwrap_or(command.first_frame)
            } else {
                command.final_frame
            };
            for frame in command.first_frame..=final_frame {
                if let Some(idx) = entry.frame_index(frame) {
                    entry.frames[idx].evict = true;
                }
            }
        }
        self.process_pending_eviction(command.image);
    }

    fn handle_drop(&mut self, command: CacheCommand) {
        if let Some(entry) = self.entries.get_mut(&command.image) {
            entry.drop_flag = true;
            for frame in entry.frames.iter_mut() {
                frame.evict = true;
            }
        }
        self.process_pending_eviction(command.image);

        let frames_remain = self.entries.get(&command.image).map(|e| !e.frames.is_empty()).unwrap_or(false);
        if !frames_remain {
            self.drop_image_record(command.image);
        }
    }

    /// Evicts every zero-locked, `evict`-flagged frame on `image`'s entry, posting a [`Location`]
    /// to the eviction queue for each and removing it from the entry (§4.10). If the entry ends
    /// up empty and its `DROP` flag is set, the image record is dropped.
    fn process_pending_eviction(&mut self, image: ImageId) {
        let Some(entry) = self.entries.get_mut(&image) else { return };
        let mut bytes_freed: u64 = 0;
        let mut evicted = Vec::new();
        entry.frames.retain(|f| {
            if f.evict && f.lock_count == 0 {
                bytes_freed += f.bytes_reserved as u64;
                evicted.push(Location { image, element: f.frame, base_address: f.base_address, bytes_committed: f.bytes_reserved });
                false
            } else {
                true
            }
        });
        let frames_remain = !entry.frames.is_empty();
        let should_drop = entry.drop_flag && !frames_remain;

        for location in evicted {
            let _ = self.memory.lock().unwrap().evict_element(location.image, location.element);
            self.eviction.producer().produce(location);
        }
        if bytes_freed > 0 {
            let mut attrs = self.attrs.lock().unwrap();
            attrs.bytes_used = attrs.bytes_used.saturating_sub(bytes_freed);
        }

        if should_drop {
            self.drop_image_record(image);
        }
    }

    fn drop_image_record(&mut self, image: ImageId) {
        self.entries.remove(&image);
        self.pending.remove(&image);
        let _ = self.memory.lock().unwrap().drop_image(image, true);
    }

    /// Consulted only when `bytes_used > bytes_limit` right after a load completes (§4.10).
    /// `MANUAL` does nothing; `IMAGE_LRU_FRAME_MRU` repeatedly evicts the least-recently-requested
    /// image's most-recently-used frame until back under budget or no eligible frame remains.
    fn apply_eviction_policy(&mut self) {
        let behavior = self.attrs.lock().unwrap().behavior;
        if behavior == EvictionBehavior::Manual {
            return;
        }
        loop {
            let over_budget = {
                let attrs = self.attrs.lock().unwrap();
                attrs.bytes_used > attrs.bytes_limit
            };
            if !over_budget {
                break;
            }
            let Some((image, frame)) = self.pick_lru_image_mru_frame() else { break };
            if let Some(entry) = self.entries.get_mut(&image) {
                if let Some(idx) = entry.frame_index(frame) {
                    entry.frames[idx].evict = true;
                }
            }
            let before = self.attrs.lock().unwrap().bytes_used;
            self.process_pending_eviction(image);
            let after = self.attrs.lock().unwrap().bytes_used;
            if after == before {
                // The chosen victim was still locked and couldn't be evicted; stop to avoid
                // spinning forever on the same frame.
                break;
            }
        }
    }

    fn pick_lru_image_mru_frame(&self) -> Option<(ImageId, FrameIndex)> {
        let (image, entry) = self
            .entries
            .iter()
            .filter(|(_, e)| e.frames.iter().any(|f| f.lock_count == 0))
            .min_by_key(|(_, e)| e.last_request_time_ns)?;
        let frame = entry
            .frames
            .iter()
            .filter(|f| f.lock_count == 0)
            .max_by_key(|f| f.last_request_time_ns)
            .map(|f| f.frame)?;
        Some((*image, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image_memory::{ImageDef, ImageMemory},
        queues::UnboundedMpsc,
    };

    fn def() -> ImageDef {
        ImageDef {
            width: 4,
            height: 4,
            element_count: 2,
            level_count: 1,
            element_bytes: 64,
            compression: Compression::None,
            format: PixelFormat::Rgba8,
        }
    }

    fn make_cache() -> (ImageCache, UnboundedMpsc<LoadRequest>) {
        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let requests: UnboundedMpsc<LoadRequest> = UnboundedMpsc::new();
        let cache = ImageCache::new(
            memory,
            requests.producer(),
            1024,
            EvictionBehavior::Manual,
            (Compression::None, Encoding::Identity),
        );
        (cache, requests)
    }

    #[test]
    fn declaration_is_idempotent_when_subsumed() {
        let (mut cache, _requests) = make_cache();
        let decl = ImageDeclaration {
            image: ImageId(1),
            file_path: "a.dds".into(),
            first_frame: 0,
            final_frame: ALL_FRAMES,
            file_offset: 0,
        };
        cache.declaration_producer().produce(decl.clone());
        cache.declaration_producer().produce(decl);
        cache.update();
        assert_eq!(cache.metadata.read().unwrap().get(&ImageId(1)).unwrap().files.len(), 1);
    }

    #[test]
    fn lock_miss_submits_single_load_request() {
        let (mut cache, requests) = make_cache();
        cache.declaration_producer().produce(ImageDeclaration {
            image: ImageId(1),
            file_path: "a.dds".into(),
            first_frame: 0,
            final_frame: ALL_FRAMES,
            file_offset: 0,
        });
        cache.definition_producer().produce(ImageDefinition {
            image: ImageId(1),
            format: PixelFormat::Rgba8,
            compression: Compression::None,
            encoding: Encoding::Identity,
            width: 4,
            height: 4,
            level_count: 1,
            element_index: 0,
            element_count: 2,
            bytes_per_element: 64,
            block_offsets: Vec::new(),
        });
        cache.update();

        let result_tx: UnboundedMpsc<CacheLockResult> = UnboundedMpsc::new();
        cache.command_producer().produce(CacheCommand {
            kind: CacheCommandKind::Lock,
            image: ImageId(1),
            first_frame: 0,
            final_frame: 0,
            evict_on_unlock: false,
            priority: 0,
            request_time_ns: 0,
            error_queue: None,
            result_queue: Some(result_tx.producer()),
        });
        cache.update();

        let mut seen = Vec::new();
        requests.drain(|r| seen.push(r));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].image, ImageId(1));
        assert_eq!(seen[0].file_path, "a.dds");
    }

    #[test]
    fn lock_on_undeclared_image_reports_not_found() {
        let (mut cache, _requests) = make_cache();
        let errors: UnboundedMpsc<CacheErrorResult> = UnboundedMpsc::new();
        cache.command_producer().produce(CacheCommand {
            kind: CacheCommandKind::Lock,
            image: ImageId(9),
            first_frame: 0,
            final_frame: 0,
            evict_on_unlock: false,
            priority: 0,
            request_time_ns: 0,
            error_queue: Some(errors.producer()),
            result_queue: None,
        });
        cache.update();
        let mut seen = Vec::new();
        errors.drain(|e| seen.push(e));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].error, CacheError::NotFound(ImageId(9)));
    }

    #[test]
    fn location_completes_waiter_and_tracks_bytes_used() {
        let (mut cache, _requests) = make_cache();
        cache.memory.lock().unwrap().reserve_image(ImageId(1), def(), Encoding::Identity).unwrap();
        cache.definition_producer().produce(ImageDefinition {
            image: ImageId(1),
            format: PixelFormat::Rgba8,
            compression: Compression::None,
            encoding: Encoding::Identity,
            width: 4,
            height: 4,
            level_count: 1,
            element_index: 0,
            element_count: 2,
            bytes_per_element: 64,
            block_offsets: Vec::new(),
        });
        cache.update();

        let results: UnboundedMpsc<CacheLockResult> = UnboundedMpsc::new();
        cache.pending.insert(ImageId(1), PendingLoad { waiters: Vec::new() });
        cache.submit_load(ImageId(1), 0, 0, 0, None, Some(&results.producer()));

        let (ptr, _levels) = cache.memory.lock().unwrap().lock_element(ImageId(1), 0).unwrap();
        cache.memory.lock().unwrap().unlock_element(ImageId(1), 0).unwrap();
        cache.location_producer().produce(Location { image: ImageId(1), element: 0, base_address: ptr as *const u8, bytes_committed: 64 });
        cache.update();

        assert_eq!(cache.bytes_used(), 64);
        let mut seen = Vec::new();
        results.drain(|r| seen.push(r));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].frame, 0);
    }

    #[test]
    fn evict_while_locked_defers_until_unlock() {
        let (mut cache, _requests) = make_cache();
        cache.memory.lock().unwrap().reserve_image(ImageId(1), def(), Encoding::Identity).unwrap();
        let (ptr, _) = cache.memory.lock().unwrap().lock_element(ImageId(1), 0).unwrap();
        cache.entries.insert(ImageId(1), CacheEntry {
            drop_flag: false,
            last_request_time_ns: 0,
            frames: vec![FrameRecord {
                frame: 0,
                lock_count: 1,
                evict: false,
                last_request_time_ns: 0,
                time_to_load_ns: 0,
                base_address: ptr as *const u8,
                bytes_reserved: 64,
            }],
        });

        cache.command_producer().produce(CacheCommand {
            kind: CacheCommandKind::Evict,
            image: ImageId(1),
            first_frame: 0,
            final_frame: 0,
            evict_on_unlock: false,
            priority: 0,
            request_time_ns: 0,
            error_queue: None,
            result_queue: None,
        });
        cache.update();
        assert!(cache.entries.get(&ImageId(1)).unwrap().frame_index(0).is_some());

        cache.command_producer().produce(CacheCommand {
            kind: CacheCommandKind::Unlock,
            image: ImageId(1),
            first_frame: 0,
            final_frame: 0,
            evict_on_unlock: false,
            priority: 0,
            request_time_ns: 0,
            error_queue: None,
            result_queue: None,
        });
        cache.update();
        assert!(cache.entries.get(&ImageId(1)).map(|e| e.frame_index(0).is_none()).unwrap_or(true));
    }
}
