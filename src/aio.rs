//! AIO driver (C4, §4.4): a single-threaded service that owns `MAX_ACTIVE` overlapped slots and
//! drives asynchronous reads/writes to completion.
//!
//! The original drives `ReadFile`/`WriteFile` through a kernel completion port. On POSIX there is
//! no direct equivalent, so completion is modeled with a small fixed pool of worker threads
//! performing blocking `pread`/`pwrite` (grounded in `unix_pipe.rs`'s habit of calling syscalls
//! directly rather than going through a buffered abstraction) and posting results back over an
//! internal channel that the driver tick drains — non-blocking in poll mode, with a timeout in
//! wait mode. Slots are tracked the same way the spec describes: a free-list stack of slot
//! indices and a parallel in-flight vector, matched to completions by linear scan rather than a
//! hash table, since `N` is small and cache-resident.

use std::{
    os::unix::io::RawFd,
    path::PathBuf,
    sync::mpsc,
    time::Duration,
};
use bitflags::bitflags;

use crate::{
    buffer_pool::BufferHandle,
    error::IoError,
    queues::{BoundedSpscConsumer, UnboundedSpscProducer},
    types::AioResultFlags,
};

/// Fixed size of the worker pool backing asynchronous reads/writes. Small and constant because
/// the kernel, not this pool, provides the actual I/O concurrency; workers just make blocking
/// syscalls look asynchronous to the driver tick.
const WORKER_COUNT: usize = 4;

bitflags! {
    /// Close predicate carried on a request (§4.4): governs whether the driver closes the file
    /// handle when posting that request's result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseFlags: u8 {
        const NONE             = 0;
        const CLOSE_ON_ERROR   = 1 << 0;
        const CLOSE_ON_COMPLETE= 1 << 1;
    }
}

/// The result record posted to a request's bundled result queue (§4.4): `(file_handle, os_error,
/// bytes_transferred, data_actual, file_offset, data_buffer, identifier, status_flags,
/// priority)`. Shared verbatim with the stream decoder (C3), which is simply a consumer of
/// `Read` completions.
#[derive(Debug, Clone, Copy)]
pub struct AioCompletion {
    pub file_handle: RawFd,
    pub os_error: Option<IoError>,
    pub bytes_transferred: usize,
    pub data_actual: usize,
    pub file_offset: u64,
    pub data_buffer: Option<BufferHandle>,
    pub identifier: u64,
    pub status: AioResultFlags,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub enum AioCommand {
    Read { file_offset: u64, buffer: BufferHandle, len: usize },
    Write { file_offset: u64, buffer: BufferHandle, len: usize },
    Flush,
    Close,
    CloseAndRename { final_size: Option<u64>, current_path: PathBuf, target_path: Option<PathBuf> },
}

impl AioCommand {
    fn is_async(&self) -> bool {
        matches!(self, AioCommand::Read { .. } | AioCommand::Write { .. })
    }
}

/// A submitted AIO request. `results` is the request's bundled allocator (§4.1): the driver never
/// looks up a client queue by identity, it just uses the handle the request already carries.
#[derive(Debug)]
pub struct AioRequest {
    pub identifier: u64,
    pub file_handle: RawFd,
    pub base_offset: u64,
    pub command: AioCommand,
    pub close_flags: CloseFlags,
    /// Status flags the caller wants echoed back on the completion (§4.5 step 9b: PIO marks a
    /// request `ENDOFSTREAM` or `RESTART` itself, since the driver has no notion of a stream's
    /// logical end — only a real zero-byte read counts as EOF to it).
    pub status_hint: AioResultFlags,
    pub priority: i32,
    pub results: UnboundedSpscProducer<AioCompletion>,
}

struct InFlightSlot {
    slot: usize,
    identifier: u64,
    file_handle: RawFd,
    close_flags: CloseFlags,
    status_hint: AioResultFlags,
    priority: i32,
    base_offset: u64,
    op_file_offset: u64,
    results: UnboundedSpscProducer<AioCompletion>,
}

/// Raw completion posted by a worker thread once its blocking syscall returns.
enum WorkerMsg {
    Done {
        slot: usize,
        os_error: Option<i32>,
        bytes_transferred: usize,
        buffer: BufferHandle,
        end_of_file: bool,
    },
    /// The distinguished shutdown key (§4.4): posted to stop the driver from processing any
    /// further completions this tick and every tick after.
    Shutdown,
}

enum Job {
    Read { slot: usize, fd: RawFd, offset: u64, buffer: BufferHandle, len: usize },
    Write { slot: usize, fd: RawFd, offset: u64, buffer: BufferHandle, len: usize },
    Shutdown,
}

pub struct AioDriver {
    commands: BoundedSpscConsumer<AioRequest>,
    job_tx: mpsc::Sender<Job>,
    worker_msg_tx: mpsc::Sender<WorkerMsg>,
    worker_msg_rx: mpsc::Receiver<WorkerMsg>,
    workers: Vec<std::thread::JoinHandle<()>>,

    max_active: usize,
    free_slots: Vec<usize>,
    in_flight: Vec<InFlightSlot>,

    deferred_reads: Vec<AioRequest>,
    deferred_writes: Vec<AioRequest>,

    shutdown: bool,
    submitted: u64,
    completed: u64,
}

/// Submit/completion counters for the ambient logging layer (§4.4 supplement, grounded in
/// `aiodriver.cc`'s rolling latency histogram — reduced here to the counters a log line can
/// usefully report per tick).
#[derive(Debug, Clone, Copy, Default)]
pub struct AioStats {
    pub submitted: u64,
    pub completed: u64,
    pub in_flight: usize,
    pub max_active: usize,
}

impl AioDriver {
    pub fn new(commands: BoundedSpscConsumer<AioRequest>, max_active: usize) -> Self {
        assert!(max_active.is_power_of_two(), "MAX_ACTIVE must be a power of two");

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (worker_msg_tx, worker_msg_rx) = mpsc::channel::<WorkerMsg>();
        let job_rx = std::sync::Arc::new(std::sync::Mutex::new(job_rx));

        let workers = (0..WORKER_COUNT)
            .map(|id| {
                let job_rx = job_rx.clone();
                let completions = worker_msg_tx.clone();
                std::thread::Builder::new()
                    .name(format!("aio-worker-{id}"))
                    .spawn(move || worker_loop(job_rx, completions))
                    .expect("failed to spawn AIO worker thread")
            })
            .collect();

        Self {
            commands,
            job_tx,
            worker_msg_tx,
            worker_msg_rx,
            workers,
            max_active,
            free_slots: (0..max_active).rev().collect(),
            in_flight: Vec::with_capacity(max_active),
            deferred_reads: Vec::new(),
            deferred_writes: Vec::new(),
            shutdown: false,
            submitted: 0,
            completed: 0,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn stats(&self) -> AioStats {
        AioStats {
            submitted: self.submitted,
            completed: self.completed,
            in_flight: self.in_flight.len(),
            max_active: self.max_active,
        }
    }

    /// Posts the distinguished shutdown completion. Idempotent modulo channel capacity.
    pub fn request_shutdown(&self) {
        let _ = self.worker_msg_tx.send(WorkerMsg::Shutdown);
    }

    /// Runs one driver tick (§4.4 steps 1-4). `wait` is `None` for poll mode (non-blocking) or
    /// `Some(timeout)` for wait mode.
    pub fn tick(&mut self, wait: Option<Duration>) {
        self.reap_completions(wait);
        if self.shutdown {
            return;
        }
        self.drain_and_submit();
    }

    fn reap_completions(&mut self, wait: Option<Duration>) {
        let mut reaped = 0;
        let first = match wait {
            Some(timeout) => self.worker_msg_rx.recv_timeout(timeout).ok(),
            None => self.worker_msg_rx.try_recv().ok(),
        };

        let mut next = first;
        while let Some(msg) = next {
            match msg {
                WorkerMsg::Shutdown => {
                    log::info!("AIO driver received shutdown completion");
                    self.shutdown = true;
                    return;
                }
                WorkerMsg::Done { slot, os_error, bytes_transferred, buffer, end_of_file } => {
                    self.complete_slot(slot, os_error, bytes_transferred, buffer, end_of_file);
                }
            }
            reaped += 1;
            if reaped >= self.max_active {
                break;
            }
            next = self.worker_msg_rx.try_recv().ok();
        }
    }

    fn complete_slot(
        &mut self,
        slot: usize,
        os_error: Option<i32>,
        bytes_transferred: usize,
        buffer: BufferHandle,
        end_of_file: bool,
    ) {
        let Some(index) = self.in_flight.iter().position(|s| s.slot == slot) else {
            log::warn!("AIO completion for unknown slot {slot}, dropping");
            return;
        };
        let entry = self.in_flight.swap_remove(index);
        self.free_slots.push(entry.slot);
        self.completed += 1;

        let mut status = entry.status_hint;
        if end_of_file {
            status |= AioResultFlags::ENDOFSTREAM;
        }

        let error = os_error.map(|e| IoError { os_error: e });
        let data_actual = if error.is_some() { 0 } else { bytes_transferred };

        let close = error.is_some() && entry.close_flags.contains(CloseFlags::CLOSE_ON_ERROR)
            || entry.close_flags.contains(CloseFlags::CLOSE_ON_COMPLETE);
        if close {
            raw_close(entry.file_handle);
        }

        entry.results.produce(AioCompletion {
            file_handle: entry.file_handle,
            os_error: error,
            bytes_transferred,
            data_actual,
            file_offset: entry.op_file_offset,
            data_buffer: Some(buffer),
            identifier: entry.identifier,
            status,
            priority: entry.priority,
        });
    }

    fn drain_and_submit(&mut self) {
        let mut reads: Vec<AioRequest> = std::mem::take(&mut self.deferred_reads);
        let mut writes: Vec<AioRequest> = std::mem::take(&mut self.deferred_writes);
        let mut flushes = Vec::new();
        let mut closes = Vec::new();
        let mut close_renames = Vec::new();

        while let Some(req) = self.commands.try_consume() {
            match req.command {
                AioCommand::Read { .. } => reads.push(req),
                AioCommand::Write { .. } => writes.push(req),
                AioCommand::Flush => flushes.push(req),
                AioCommand::Close => closes.push(req),
                AioCommand::CloseAndRename { .. } => close_renames.push(req),
            }
        }

        for req in reads {
            self.submit_or_defer(req);
        }
        for req in writes {
            self.submit_or_defer(req);
        }
        for req in flushes {
            self.run_sync(req);
        }
        for req in closes {
            self.run_sync(req);
        }
        for req in close_renames {
            self.run_sync(req);
        }
    }

    fn submit_or_defer(&mut self, req: AioRequest) {
        debug_assert!(req.command.is_async());
        let Some(slot) = self.free_slots.pop() else {
            log::debug!("AIO driver at MAX_ACTIVE={}, deferring request {}", self.max_active, req.identifier);
            match req.command {
                AioCommand::Read { .. } => self.deferred_reads.push(req),
                AioCommand::Write { .. } => self.deferred_writes.push(req),
                _ => unreachable!("only async commands reach submit_or_defer"),
            }
            return;
        };

        let absolute_offset;
        let buffer_on_failure;
        let job = match req.command {
            AioCommand::Read { file_offset, buffer, len } => {
                absolute_offset = req.base_offset + file_offset;
                buffer_on_failure = buffer;
                Job::Read { slot, fd: req.file_handle, offset: absolute_offset, buffer, len }
            }
            AioCommand::Write { file_offset, buffer, len } => {
                absolute_offset = req.base_offset + file_offset;
                buffer_on_failure = buffer;
                Job::Write { slot, fd: req.file_handle, offset: absolute_offset, buffer, len }
            }
            _ => unreachable!("only async commands reach submit_or_defer"),
        };

        // §9: a failed submit must still complete the request rather than leaving its slot and
        // result queue hanging forever, so the slot is freed and a synchronous error completion
        // is posted in place of the worker's eventual one.
        if self.job_tx.send(job).is_err() {
            log::error!("AIO worker pool gone, completing request {} with an error", req.identifier);
            self.free_slots.push(slot);
            self.completed += 1;
            let close = req.close_flags.contains(CloseFlags::CLOSE_ON_ERROR)
                || req.close_flags.contains(CloseFlags::CLOSE_ON_COMPLETE);
            if close {
                raw_close(req.file_handle);
            }
            req.results.produce(AioCompletion {
                file_handle: req.file_handle,
                os_error: Some(IoError { os_error: libc::EPIPE }),
                bytes_transferred: 0,
                data_actual: 0,
                file_offset: absolute_offset - req.base_offset,
                data_buffer: Some(buffer_on_failure),
                identifier: req.identifier,
                status: req.status_hint,
                priority: req.priority,
            });
            return;
        }

        self.in_flight.push(InFlightSlot {
            slot,
            identifier: req.identifier,
            file_handle: req.file_handle,
            close_flags: req.close_flags,
            status_hint: req.status_hint,
            priority: req.priority,
            base_offset: req.base_offset,
            op_file_offset: absolute_offset - req.base_offset,
            results: req.results,
        });
        self.submitted += 1;
    }

    /// Runs a synchronous command (`FLUSH`/`CLOSE`/`CLOSE_AND_RENAME`) inline and posts its
    /// result immediately (§4.4 step 3).
    fn run_sync(&mut self, req: AioRequest) {
        let (os_error, close_now) = match &req.command {
            AioCommand::Flush => (raw_fsync(req.file_handle), false),
            AioCommand::Close => (None, true),
            AioCommand::CloseAndRename { final_size, .. } => {
                let mut err = final_size.and_then(|size| raw_ftruncate(req.file_handle, size));
                if err.is_none() {
                    err = raw_fsync(req.file_handle);
                }
                (err, true)
            }
            _ => unreachable!("only synchronous commands reach run_sync"),
        };

        if close_now {
            raw_close(req.file_handle);
        }

        if let AioCommand::CloseAndRename { current_path, target_path, .. } = &req.command {
            if os_error.is_none() {
                match target_path {
                    Some(dest) => {
                        if let Err(e) = std::fs::rename(current_path, dest) {
                            log::warn!("CLOSE_AND_RENAME failed to rename {current_path:?} -> {dest:?}: {e}");
                        }
                    }
                    None => {
                        if let Err(e) = std::fs::remove_file(current_path) {
                            log::warn!("CLOSE_AND_RENAME failed to remove {current_path:?}: {e}");
                        }
                    }
                }
            }
        }

        self.completed += 1;
        req.results.produce(AioCompletion {
            file_handle: req.file_handle,
            os_error: os_error.map(|e| IoError { os_error: e }),
            bytes_transferred: 0,
            data_actual: 0,
            file_offset: req.base_offset,
            data_buffer: None,
            identifier: req.identifier,
            status: AioResultFlags::NONE,
            priority: req.priority,
        });
    }
}

/// Returns `errno` on failure, matching the `os_error` field the rest of the driver deals in.
fn raw_fsync(fd: RawFd) -> Option<i32> {
    if unsafe { libc::fsync(fd) } == 0 {
        None
    } else {
        Some(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

fn raw_ftruncate(fd: RawFd, size: u64) -> Option<i32> {
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } == 0 {
        None
    } else {
        Some(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

fn raw_close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn worker_loop(job_rx: std::sync::Arc<std::sync::Mutex<mpsc::Receiver<Job>>>, completions: mpsc::Sender<WorkerMsg>) {
    loop {
        let job = {
            let rx = job_rx.lock().unwrap();
            rx.recv()
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => return,
        };

        match job {
            Job::Shutdown => return,
            Job::Read { slot, fd, offset, buffer, len } => {
                let slice = unsafe { buffer.as_mut_slice() };
                let n = unsafe {
                    libc::pread(fd, slice.as_mut_ptr() as *mut libc::c_void, len, offset as libc::off_t)
                };
                let (os_error, bytes, eof) = if n < 0 {
                    (Some(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)), 0, false)
                } else {
                    (None, n as usize, n == 0)
                };
                let _ = completions.send(WorkerMsg::Done { slot, os_error, bytes_transferred: bytes, buffer, end_of_file: eof });
            }
            Job::Write { slot, fd, offset, buffer, len } => {
                let slice = unsafe { buffer.as_mut_slice() };
                let n = unsafe {
                    libc::pwrite(fd, slice.as_ptr() as *const libc::c_void, len, offset as libc::off_t)
                };
                let (os_error, bytes) = if n < 0 {
                    (Some(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)), 0)
                } else {
                    (None, n as usize)
                };
                let _ = completions.send(WorkerMsg::Done { slot, os_error, bytes_transferred: bytes, buffer, end_of_file: false });
            }
        }
    }
}

impl Drop for AioDriver {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.job_tx.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::IoBufferPool;
    use crate::queues::{BoundedSpsc, UnboundedSpsc};
    use std::os::unix::io::AsRawFd;
    use std::io::Write as _;

    fn scratch_file(contents: &[u8]) -> (tempfile::NamedTempFile, RawFd) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        let fd = f.as_raw_fd();
        (f, fd)
    }

    #[test]
    fn read_request_round_trips_through_worker_pool() {
        let (_file, fd) = scratch_file(b"hello world");
        let pool = std::sync::Arc::new(IoBufferPool::new(*crate::util::PAGE_SIZE, *crate::util::PAGE_SIZE));
        let (cmd_producer, cmd_consumer) = BoundedSpsc::new(8).split();
        let (result_producer, result_consumer) = UnboundedSpsc::new().split();

        let mut driver = AioDriver::new(cmd_consumer, 8);
        let buffer = pool.get_buffer().unwrap();

        cmd_producer.try_produce(AioRequest {
            identifier: 42,
            file_handle: fd,
            base_offset: 0,
            command: AioCommand::Read { file_offset: 0, buffer, len: 11 },
            close_flags: CloseFlags::NONE,
            status_hint: AioResultFlags::NONE,
            priority: 0,
            results: result_producer,
        }).unwrap();

        driver.tick(None);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut completion = None;
        while completion.is_none() && std::time::Instant::now() < deadline {
            driver.tick(Some(Duration::from_millis(50)));
            completion = result_consumer.try_consume();
        }

        let completion = completion.expect("read completion never arrived");
        assert_eq!(completion.identifier, 42);
        assert!(completion.os_error.is_none());
        assert_eq!(completion.data_actual, 11);
        let buf = unsafe { completion.data_buffer.unwrap().as_mut_slice() };
        assert_eq!(&buf[..11], b"hello world");
    }

    #[test]
    fn max_active_must_be_power_of_two() {
        let (_p, c) = BoundedSpsc::<AioRequest>::new(8).split();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| AioDriver::new(c, 3)));
        assert!(result.is_err());
    }

    #[test]
    fn shutdown_completion_stops_tick_processing() {
        let (_p, c) = BoundedSpsc::<AioRequest>::new(8).split();
        let mut driver = AioDriver::new(c, 8);
        driver.request_shutdown();
        driver.tick(Some(Duration::from_millis(200)));
        assert!(driver.is_shutdown());
    }
}
