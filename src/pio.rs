//! PIO driver (C5, §4.5): owns the AIO driver and mediates between it and many concurrent
//! streams, scheduling reads by priority and, for a subset of streams, pacing delivery to an
//! interval instead of handing data to the decoder as fast as it arrives.
//!
//! The per-tick eligibility heap is rebuilt from scratch every tick rather than incrementally
//! maintained, following the same reasoning the teacher applies to `capture.rs`'s `Shard` heap:
//! a `BinaryHeap` has no efficient arbitrary-element removal, and rebuilding from a small active
//! set is cheaper than working around that.

use std::{collections::BinaryHeap, os::unix::io::RawFd, time::Duration};

use crate::{
    aio::{AioCommand, AioCompletion, AioDriver, AioRequest, CloseFlags},
    buffer_pool::IoBufferPool,
    impl_ord_by,
    queues::{BoundedSpsc, BoundedSpscProducer, UnboundedMpsc, UnboundedSpsc, UnboundedSpscConsumer, UnboundedSpscProducer},
    stream_decoder::DecoderRefcount,
    types::AioResultFlags,
    util::Clock,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    None,
    Paused,
    ClosePending,
    Closed,
}

/// `Load` streams deliver their data once and close at EOF; `Persistent` streams restart from
/// the beginning once they reach `base_size`, matching the spec's "stream-once vs persistent"
/// distinction in step 9b.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Load,
    Persistent,
}

/// `(base_priority, open_order)`: ties break by open order, lower wins (§4.5). Ordered so that a
/// max-heap pop yields the highest-priority, earliest-opened stream first.
#[derive(Debug, Clone, Copy)]
struct EligibilityKey {
    base_priority: i32,
    open_order: u64,
}

impl_ord_by!(EligibilityKey, |a: &Self, b: &Self| a
    .base_priority
    .cmp(&b.base_priority)
    .then(b.open_order.cmp(&a.open_order)));

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    key: EligibilityKey,
    index: usize,
}

impl_ord_by!(HeapEntry, |a: &Self, b: &Self| a.key.cmp(&b.key));

/// A fixed, 4-slot ring of queued interval-delivery results (§4.5 step 2-3). Power-of-two
/// capacity mirrors the bounded SPSC queues in C1, though this ring is private per-stream state,
/// not a shared lock-free structure.
struct DeliveryRing {
    buf: [Option<AioCompletion>; 4],
    head: usize,
    len: usize,
}

impl DeliveryRing {
    fn new() -> Self {
        Self { buf: [None, None, None, None], head: 0, len: 0 }
    }

    fn push(&mut self, item: AioCompletion) -> Result<(), AioCompletion> {
        if self.len == self.buf.len() {
            return Err(item);
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = Some(item);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<AioCompletion> {
        if self.len == 0 {
            return None;
        }
        let item = self.buf[self.head].take();
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        item
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A request to begin streaming a file region (§4.5 step 6).
pub struct OpenRequest {
    pub identifier: u64,
    pub file_handle: RawFd,
    pub base_offset: u64,
    pub base_size: u64,
    pub sector_size: u64,
    pub kind: StreamKind,
    pub base_priority: i32,
    /// `None` for as-fast-as-possible delivery; `Some(interval)` for interval-paced streams,
    /// whose AIO results are routed through PIO's delivery ring instead of straight to the
    /// decoder.
    pub interval: Option<Duration>,
    pub decoder_producer: UnboundedSpscProducer<AioCompletion>,
    pub pool: Arc<IoBufferPool>,
    pub refcount: DecoderRefcount,
}

pub enum ControlCommand {
    Pause(u64),
    Resume(u64),
    Rewind(u64),
    Seek(u64, u64),
    Stop(u64),
}

struct ActiveStream {
    id: u64,
    status: StreamStatus,
    kind: StreamKind,
    file_handle: RawFd,
    base_offset: u64,
    base_size: u64,
    sector_size: u64,
    base_priority: i32,
    open_order: u64,
    read_offset: u64,
    interval_ns: Option<u64>,
    next_deadline: u64,
    ring: DeliveryRing,
    decoder_producer: UnboundedSpscProducer<AioCompletion>,
    pool: Arc<IoBufferPool>,
    refcount: DecoderRefcount,
}

pub struct PioDriver {
    aio: AioDriver,
    aio_producer: BoundedSpscProducer<AioRequest>,
    open_requests: UnboundedMpsc<OpenRequest>,
    controls: UnboundedMpsc<ControlCommand>,
    interval_producer: UnboundedSpscProducer<AioCompletion>,
    interval_consumer: UnboundedSpscConsumer<AioCompletion>,

    clock: Clock,
    tick_ring: [u64; 8],
    tick_ring_pos: usize,
    last_tick_at: u64,

    active: Vec<ActiveStream>,
    open_order_counter: u64,
    /// Reads that lost the race for `aio_producer`'s bounded queue last tick, carried over and
    /// retried before any newly scheduled read (mirrors `AioDriver`'s own `deferred_reads`). Their
    /// stream-side effects (advanced `read_offset`, refcount, acquired buffer) already happened
    /// when they were built, so they must eventually be submitted rather than dropped.
    deferred_reads: Vec<AioRequest>,
}

impl PioDriver {
    pub fn new(aio_max_active: usize) -> Self {
        let (aio_producer, aio_consumer) = BoundedSpsc::new(aio_max_active).split();
        let (interval_producer, interval_consumer) = UnboundedSpsc::new().split();
        let clock = Clock::new();
        Self {
            aio: AioDriver::new(aio_consumer, aio_max_active),
            aio_producer,
            open_requests: UnboundedMpsc::new(),
            controls: UnboundedMpsc::new(),
            interval_producer,
            interval_consumer,
            last_tick_at: clock.now_ns(),
            clock,
            tick_ring: [0; 8],
            tick_ring_pos: 0,
            active: Vec::new(),
            open_order_counter: 0,
            deferred_reads: Vec::new(),
        }
    }

    pub fn open_request_producer(&self) -> crate::queues::MpscProducer<OpenRequest> {
        self.open_requests.producer()
    }

    pub fn control_producer(&self) -> crate::queues::MpscProducer<ControlCommand> {
        self.controls.producer()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn mean_tick_ns(&self) -> u64 {
        self.tick_ring.iter().sum::<u64>() / self.tick_ring.len() as u64
    }

    /// Runs one PIO driver tick (§4.5 steps 1-10).
    pub fn tick(&mut self) {
        // 1: update clock, append to the ring.
        let now = self.clock.now_ns();
        let elapsed = now.saturating_sub(self.last_tick_at);
        self.last_tick_at = now;
        self.tick_ring[self.tick_ring_pos % self.tick_ring.len()] = elapsed;
        self.tick_ring_pos = self.tick_ring_pos.wrapping_add(1);
        let mean_tick = self.mean_tick_ns();

        self.aio.tick(None);

        // 2: route interval results into the owning stream's ring, or straight to the decoder.
        while let Some(completion) = self.interval_consumer.try_consume() {
            let Some(stream) = self.active.iter_mut().find(|s| s.id == completion.identifier) else {
                log::warn!("interval-delivery completion for unknown stream {}", completion.identifier);
                continue;
            };
            let is_plain_data = completion.os_error.is_none()
                && completion.status.is_empty()
                && completion.data_actual > 0;
            if is_plain_data {
                if let Err(dropped) = stream.ring.push(completion) {
                    log::warn!("delivery ring full for stream {}, forwarding directly", stream.id);
                    stream.decoder_producer.produce(dropped);
                }
            } else {
                stream.decoder_producer.produce(completion);
            }
        }

        // 3: flush ring entries whose deadline has arrived.
        for stream in self.active.iter_mut() {
            let Some(interval_ns) = stream.interval_ns else { continue };
            if now + mean_tick >= stream.next_deadline && !stream.ring.is_empty() {
                if let Some(item) = stream.ring.pop() {
                    stream.decoder_producer.produce(item);
                    stream.next_deadline += interval_ns;
                }
            }
        }

        // 4: submit CLOSE for streams pending close.
        for stream in self.active.iter_mut() {
            if stream.status != StreamStatus::ClosePending {
                continue;
            }
            let submitted = self.aio_producer.try_produce(AioRequest {
                identifier: stream.id,
                file_handle: stream.file_handle,
                base_offset: stream.base_offset,
                command: AioCommand::Close,
                close_flags: CloseFlags::CLOSE_ON_COMPLETE,
                status_hint: AioResultFlags::NONE,
                priority: stream.base_priority,
                results: stream.decoder_producer.clone(),
            }).is_ok();
            if submitted {
                stream.status = StreamStatus::Closed;
                stream.refcount.addref();
            }
        }

        // 5: reap closed streams.
        self.active.retain_mut(|s| {
            if s.status == StreamStatus::Closed {
                s.refcount.release();
                false
            } else {
                true
            }
        });

        // 6: admit newly opened streams.
        self.open_requests.drain(|req| {
            let next_deadline = match req.interval {
                Some(interval) if !interval.is_zero() => now.saturating_add(interval.as_nanos() as u64),
                _ => u64::MAX,
            };
            self.active.push(ActiveStream {
                id: req.identifier,
                status: StreamStatus::None,
                kind: req.kind,
                file_handle: req.file_handle,
                base_offset: req.base_offset,
                base_size: req.base_size,
                sector_size: req.sector_size,
                base_priority: req.base_priority,
                open_order: self.open_order_counter,
                read_offset: 0,
                interval_ns: req.interval.filter(|i| !i.is_zero()).map(|i| i.as_nanos() as u64),
                next_deadline,
                ring: DeliveryRing::new(),
                decoder_producer: req.decoder_producer,
                pool: req.pool,
                refcount: req.refcount,
            });
            self.open_order_counter += 1;
        });

        // 7: apply control commands.
        let mut commands = Vec::new();
        self.controls.drain(|c| commands.push(c));
        for command in commands {
            self.apply_control(command);
        }

        // 8: rebuild the eligibility heap.
        let mut heap = BinaryHeap::new();
        for (index, stream) in self.active.iter().enumerate() {
            if stream.status == StreamStatus::None {
                heap.push(HeapEntry {
                    key: EligibilityKey { base_priority: stream.base_priority, open_order: stream.open_order },
                    index,
                });
            }
        }

        // 9: schedule reads while there's an eligible stream and AIO has room. `pending_reads`
        // starts with last tick's leftovers so they're retried ahead of newly eligible streams,
        // and the loop is bounded by requests already queued this tick plus AIO's own in-flight
        // count so we never admit more than `max_active` can actually hold.
        let stats = self.aio.stats();
        let mut pending_reads = std::mem::take(&mut self.deferred_reads);
        while pending_reads.len() + stats.in_flight < stats.max_active {
            let Some(entry) = heap.pop() else { break };
            let index = entry.index;
            let Some(buffer) = self.active[index].pool.get_buffer() else {
                log::debug!("buffer pool exhausted, skipping stream {} this tick", self.active[index].id);
                continue;
            };

            let stream = &mut self.active[index];
            let buffer_size = stream.pool.alloc_size() as u64;
            let file_offset = stream.read_offset;
            let final_offset = stream.read_offset + buffer_size;

            let (len, status_hint, close_flags) = if final_offset < stream.base_size {
                stream.read_offset = final_offset;
                (buffer_size, AioResultFlags::NONE, CloseFlags::NONE)
            } else {
                let remaining = stream.base_size - stream.read_offset;
                match stream.kind {
                    StreamKind::Load => {
                        stream.status = StreamStatus::Closed;
                        (remaining, AioResultFlags::ENDOFSTREAM, CloseFlags::CLOSE_ON_COMPLETE)
                    }
                    StreamKind::Persistent => {
                        stream.read_offset = 0;
                        (remaining, AioResultFlags::RESTART, CloseFlags::NONE)
                    }
                }
            };

            let results = match stream.interval_ns {
                Some(_) => self.interval_producer.clone(),
                None => stream.decoder_producer.clone(),
            };
            stream.refcount.addref();

            pending_reads.push(AioRequest {
                identifier: stream.id,
                file_handle: stream.file_handle,
                base_offset: stream.base_offset,
                command: AioCommand::Read { file_offset, buffer, len: len as usize },
                close_flags,
                status_hint,
                priority: entry.key.base_priority,
                results,
            });
        }

        // 10: flush the priority-sorted pending reads into AIO's bounded queue. Anything that
        // still doesn't fit is carried into `deferred_reads` for next tick rather than dropped:
        // its buffer, refcount and read_offset advance already happened and must not be lost.
        for request in pending_reads {
            if let Err(request) = self.aio_producer.try_produce(request) {
                log::debug!("AIO command queue full, deferring request {} to next tick", request.identifier);
                self.deferred_reads.push(request);
            }
        }
    }

    fn apply_control(&mut self, command: ControlCommand) {
        fn find(active: &mut Vec<ActiveStream>, id: u64) -> Option<&mut ActiveStream> {
            active.iter_mut().find(|s| s.id == id)
        }
        match command {
            ControlCommand::Pause(id) => {
                if let Some(s) = find(&mut self.active, id) {
                    s.status = StreamStatus::Paused;
                }
            }
            ControlCommand::Resume(id) => {
                if let Some(s) = find(&mut self.active, id) {
                    if s.status == StreamStatus::Paused {
                        s.status = StreamStatus::None;
                    }
                }
            }
            ControlCommand::Rewind(id) => {
                if let Some(s) = find(&mut self.active, id) {
                    s.status = StreamStatus::None;
                    s.read_offset = 0;
                }
            }
            ControlCommand::Seek(id, offset) => {
                if let Some(s) = find(&mut self.active, id) {
                    s.status = StreamStatus::None;
                    s.read_offset = crate::util::round_down_u64(offset, s.sector_size);
                }
            }
            ControlCommand::Stop(id) => {
                if let Some(s) = find(&mut self.active, id) {
                    s.status = StreamStatus::ClosePending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_key_orders_by_priority_then_open_order() {
        let high = EligibilityKey { base_priority: 5, open_order: 10 };
        let low = EligibilityKey { base_priority: 1, open_order: 0 };
        assert!(high > low);

        let earlier = EligibilityKey { base_priority: 3, open_order: 1 };
        let later = EligibilityKey { base_priority: 3, open_order: 2 };
        assert!(earlier > later, "lower open_order must win ties");
    }

    #[test]
    fn delivery_ring_is_fifo_and_bounded() {
        let mut ring = DeliveryRing::new();
        let mk = |id| AioCompletion {
            file_handle: -1,
            os_error: None,
            bytes_transferred: 1,
            data_actual: 1,
            file_offset: 0,
            data_buffer: None,
            identifier: id,
            status: AioResultFlags::NONE,
            priority: 0,
        };
        for i in 0..4 {
            assert!(ring.push(mk(i)).is_ok());
        }
        assert!(ring.push(mk(99)).is_err());
        for i in 0..4 {
            assert_eq!(ring.pop().unwrap().identifier, i);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn new_driver_starts_with_no_active_streams() {
        let driver = PioDriver::new(8);
        assert_eq!(driver.active_count(), 0);
    }
}
