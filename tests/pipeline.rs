//! End-to-end tests driving declaration -> load -> lock through the real loader, cache and PIO
//! driver against actual files on disk (§8's "concrete scenarios", exercised here with the
//! production [`FsVfs`] rather than a mock).

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use image_pipeline::{
    buffer_pool::IoBufferPool,
    cache::{CacheCommand, CacheCommandKind, CacheErrorResult, CacheLockResult, ImageCache, ImageDeclaration},
    config::EvictionBehavior,
    image_memory::ImageMemory,
    loader::ImageLoader,
    pio::PioDriver,
    queues::UnboundedMpsc,
    types::{Compression, Encoding, ImageId, ALL_FRAMES},
    util::PAGE_SIZE,
    vfs::FsVfs,
};

fn le(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Writes a minimal single-mip-level, single-element uncompressed DDS file.
fn write_dds(path: &std::path::Path, width: u32, height: u32, pixels: &[u8]) {
    let mut out = Vec::new();
    out.extend_from_slice(&le(0x2053_4444)); // "DDS "
    let mut header = [0u8; 124];
    header[0..4].copy_from_slice(&le(124));
    header[4..8].copy_from_slice(&le(0x2 | 0x4)); // CAPS | HEIGHT | WIDTH
    header[8..12].copy_from_slice(&le(height));
    header[12..16].copy_from_slice(&le(width));
    header[76..80].copy_from_slice(&le(0));
    header[84..88].copy_from_slice(&le(32)); // RGBA8
    out.extend_from_slice(&header);
    out.extend_from_slice(pixels);
    std::fs::File::create(path).unwrap().write_all(&out).unwrap();
}

struct Pipeline {
    loader: ImageLoader,
    pio: PioDriver,
    cache: ImageCache,
}

impl Pipeline {
    fn new() -> Self {
        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let vfs = Arc::new(FsVfs::default());
        let pool = Arc::new(IoBufferPool::new(8 * (*PAGE_SIZE), *PAGE_SIZE));
        let pio = PioDriver::new(8);
        let loader = ImageLoader::new(memory.clone(), vfs, pool, pio.open_request_producer(), pio.control_producer());
        let cache = ImageCache::new(
            memory,
            loader.request_producer(),
            64 * 1024 * 1024,
            EvictionBehavior::Manual,
            (Compression::None, Encoding::Identity),
        );
        Self { loader, pio, cache }
    }

    /// Advances loader, PIO and cache until the loader has no active parsers and every queue is
    /// quiescent, or `max_ticks` is exhausted.
    fn run_to_quiescence(&mut self, max_ticks: usize) {
        for _ in 0..max_ticks {
            self.pio.tick();
            self.loader.tick();

            let mut defs = Vec::new();
            self.loader.definition_consumer().drain(|d| defs.push(d));
            for d in defs {
                self.cache.definition_producer().produce(d);
            }
            let mut errs = Vec::new();
            self.loader.error_consumer().drain(|e| errs.push(e));
            for e in errs {
                panic!("unexpected loader error: {:?}", e.error_code);
            }

            self.cache.update();

            if self.loader.active_count() == 0 && self.pio.active_count() == 0 {
                break;
            }
        }
    }
}

#[test]
fn single_file_load_and_lock_delivers_pixel_data() {
    let mut pipeline = Pipeline::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.dds");
    let pixels = vec![7u8; 4 * 4 * 4];
    write_dds(&path, 4, 4, &pixels);

    pipeline.cache.declaration_producer().produce(ImageDeclaration {
        image: ImageId(1),
        file_path: path.to_str().unwrap().to_string(),
        first_frame: 0,
        final_frame: ALL_FRAMES,
        file_offset: 0,
    });
    pipeline.cache.update();

    let results: UnboundedMpsc<CacheLockResult> = UnboundedMpsc::new();
    let errors: UnboundedMpsc<CacheErrorResult> = UnboundedMpsc::new();
    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Lock,
        image: ImageId(1),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: Some(errors.producer()),
        result_queue: Some(results.producer()),
    });
    pipeline.cache.update();

    pipeline.run_to_quiescence(50);
    pipeline.cache.update();

    let mut seen = Vec::new();
    results.drain(|r| seen.push(r));
    let mut failures = Vec::new();
    errors.drain(|e| failures.push(e));

    assert!(failures.is_empty(), "unexpected cache errors: {:?}", failures.iter().map(|f| f.error).collect::<Vec<_>>());
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].image, ImageId(1));
    assert_eq!(seen[0].frame, 0);
    assert!(!seen[0].base_address.is_null());
    assert!(pipeline.cache.bytes_used() > 0);
}

#[test]
fn lock_coalescing_delivers_one_load_to_both_waiting_queues() {
    let mut pipeline = Pipeline::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.dds");
    write_dds(&path, 4, 4, &vec![9u8; 4 * 4 * 4]);

    pipeline.cache.declaration_producer().produce(ImageDeclaration {
        image: ImageId(7),
        file_path: path.to_str().unwrap().to_string(),
        first_frame: 0,
        final_frame: ALL_FRAMES,
        file_offset: 0,
    });
    pipeline.cache.update();

    let results_a: UnboundedMpsc<CacheLockResult> = UnboundedMpsc::new();
    let results_b: UnboundedMpsc<CacheLockResult> = UnboundedMpsc::new();

    // Two independent lockers race for the same frame before the load completes; both queues
    // must still see the single resulting completion (§4.10 load coalescing).
    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Lock,
        image: ImageId(7),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: None,
        result_queue: Some(results_a.producer()),
    });
    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Lock,
        image: ImageId(7),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: None,
        result_queue: Some(results_b.producer()),
    });
    pipeline.cache.update();

    pipeline.run_to_quiescence(50);
    pipeline.cache.update();

    assert_eq!(results_a.len(), 1);
    assert_eq!(results_b.len(), 1);
}

#[test]
fn evict_while_locked_keeps_the_image_record_until_unlock() {
    let mut pipeline = Pipeline::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evict.dds");
    write_dds(&path, 4, 4, &vec![3u8; 4 * 4 * 4]);

    pipeline.cache.declaration_producer().produce(ImageDeclaration {
        image: ImageId(3),
        file_path: path.to_str().unwrap().to_string(),
        first_frame: 0,
        final_frame: ALL_FRAMES,
        file_offset: 0,
    });
    pipeline.cache.update();

    let results: UnboundedMpsc<CacheLockResult> = UnboundedMpsc::new();
    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Lock,
        image: ImageId(3),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: None,
        result_queue: Some(results.producer()),
    });
    pipeline.cache.update();
    pipeline.run_to_quiescence(50);
    pipeline.cache.update();
    assert_eq!(results.len(), 1);

    let bytes_before = pipeline.cache.bytes_used();
    assert!(bytes_before > 0);

    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Evict,
        image: ImageId(3),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: None,
        result_queue: None,
    });
    pipeline.cache.update();
    // Still locked: bytes_used unchanged, eviction deferred.
    assert_eq!(pipeline.cache.bytes_used(), bytes_before);

    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Unlock,
        image: ImageId(3),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: None,
        result_queue: None,
    });
    pipeline.cache.update();

    let mut evicted = Vec::new();
    pipeline.cache.eviction_consumer().drain(|l| evicted.push(l));
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].image, ImageId(3));
    assert_eq!(pipeline.cache.bytes_used(), 0);
}

#[test]
fn lock_on_undeclared_image_is_reported_not_found() {
    let mut pipeline = Pipeline::new();
    let errors: UnboundedMpsc<CacheErrorResult> = UnboundedMpsc::new();
    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Lock,
        image: ImageId(99),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: Some(errors.producer()),
        result_queue: None,
    });
    pipeline.cache.update();

    let mut seen = Vec::new();
    errors.drain(|e| seen.push(e));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].image, ImageId(99));
}

#[test]
fn missing_file_surfaces_file_access_error_from_loader() {
    let mut pipeline = Pipeline::new();
    pipeline.cache.declaration_producer().produce(ImageDeclaration {
        image: ImageId(4),
        file_path: "/nonexistent/pipeline-test.dds".to_string(),
        first_frame: 0,
        final_frame: ALL_FRAMES,
        file_offset: 0,
    });
    pipeline.cache.update();

    let errors: UnboundedMpsc<CacheErrorResult> = UnboundedMpsc::new();
    pipeline.cache.command_producer().produce(CacheCommand {
        kind: CacheCommandKind::Lock,
        image: ImageId(4),
        first_frame: 0,
        final_frame: 0,
        evict_on_unlock: false,
        priority: 0,
        request_time_ns: 0,
        error_queue: Some(errors.producer()),
        result_queue: None,
    });
    pipeline.cache.update();

    // Drive the loader directly: a load that never produces a Location has nothing to surface
    // through the cache's own error path (the cache's LOCK error path only covers NOT_FOUND), so
    // this exercises the loader's own error queue end to end instead.
    pipeline.pio.tick();
    pipeline.loader.tick();
    let mut loader_errors = Vec::new();
    pipeline.loader.error_consumer().drain(|e| loader_errors.push(e));
    assert_eq!(loader_errors.len(), 1);
    assert_eq!(loader_errors[0].image_id, ImageId(4));
}
