//! Stream decoder (C3, §4.3): a pull-model facade over one logical stream. It receives completed
//! AIO read buffers, exposes a contiguous decoded window, and returns buffers to the I/O buffer
//! pool once a parser has consumed them.

use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
use crate::{
    aio::AioCompletion,
    buffer_pool::{BufferHandle, IoBufferPool},
    queues::{UnboundedSpscConsumer, MpscProducer},
    types::AioResultFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillResult {
    Start,
    Yield,
    Error,
}

/// Reference count shared between PIO (on stream open), AIO (per in-flight request) and the
/// parser (while it holds the decoder), per §4.3 and design note §9. Rust's ownership already
/// keeps the memory alive; this tracks the spec's protocol-level "who still cares about this
/// stream" accounting, which callers use to decide when the logical stream can be torn down.
#[derive(Clone)]
pub struct DecoderRefcount(Arc<AtomicUsize>);

impl DecoderRefcount {
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(1)))
    }

    pub fn addref(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases one reference, returning the count remaining.
    pub fn release(&self) -> usize {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "decoder refcount underflow");
        prev - 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for DecoderRefcount {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StreamDecoder {
    pub refcount: DecoderRefcount,
    pool: Arc<IoBufferPool>,
    results: UnboundedSpscConsumer<AioCompletion>,
    returns: MpscProducer<BufferHandle>,

    current: Option<BufferHandle>,
    /// Valid byte count of `current` (i.e. the completed read's `data_actual`).
    window_len: u64,
    /// Offset within the current window of the first unread byte.
    read_cursor: u64,
    /// File offset corresponding to the start of the current window.
    file_offset: u64,
    /// Decode-stream offset corresponding to the start of the current window.
    decode_offset: u64,
    at_end: bool,
    errored: bool,
}

impl StreamDecoder {
    pub fn new(
        pool: Arc<IoBufferPool>,
        results: UnboundedSpscConsumer<AioCompletion>,
        returns: MpscProducer<BufferHandle>,
    ) -> Self {
        Self {
            refcount: DecoderRefcount::new(),
            pool,
            results,
            returns,
            current: None,
            window_len: 0,
            read_cursor: 0,
            file_offset: 0,
            decode_offset: 0,
            at_end: false,
            errored: false,
        }
    }

    /// Bytes remaining, unread, in the current decoded window.
    pub fn amount(&self) -> u64 {
        self.window_len - self.read_cursor
    }

    /// Logical position of the first unread byte in the current window: `(file_offset,
    /// decode_offset)` (§4.3).
    pub fn pos(&self) -> (u64, u64) {
        (self.file_offset + self.read_cursor, self.decode_offset + self.read_cursor)
    }

    pub fn atend(&self) -> bool {
        self.at_end
    }

    /// Returns a slice over the unread portion of the current window.
    pub fn unread(&self) -> &[u8] {
        match &self.current {
            None => &[],
            Some(buf) => {
                let slice = unsafe { buf.as_mut_slice() };
                &slice[self.read_cursor as usize..self.window_len as usize]
            }
        }
    }

    /// Consumes up to `len` bytes from the current window, advancing `read_cursor`, and returns
    /// the slice consumed. `len` must not exceed `amount()`.
    pub fn consume(&mut self, len: u64) -> &[u8] {
        assert!(len <= self.amount());
        let buf = self.current.as_ref().expect("consume() called on an empty window");
        let slice = unsafe { buf.as_mut_slice() };
        let start = self.read_cursor as usize;
        let end = start + len as usize;
        self.read_cursor += len;
        &slice[start..end]
    }

    /// Pops the next queued AIO result and makes it the current window, returning the previous
    /// window's buffer (if any) so the caller returns it to the pool.
    pub fn nextbuf(&mut self) -> Option<Option<BufferHandle>> {
        let result = self.results.try_consume()?;
        let previous = self.current.take();

        if let Some(os_error) = result.os_error {
            log::warn!("stream decoder observed I/O error: {}", os_error);
            self.errored = true;
            self.current = None;
            if let Some(buf) = result.data_buffer {
                self.returns.produce(buf);
            }
            return Some(previous);
        }

        let buffer = result.data_buffer.expect("successful read completion always carries a buffer");
        self.file_offset = result.file_offset;
        self.decode_offset += self.window_len;
        self.read_cursor = 0;
        self.window_len = result.data_actual as u64;
        self.current = Some(buffer);
        if result.status.contains(AioResultFlags::ENDOFSTREAM) {
            self.at_end = true;
        }
        if result.status.contains(AioResultFlags::RESTART) {
            self.decode_offset = 0;
        }

        Some(previous)
    }

    /// The passthrough `refill()` entry point (§4.3): swaps in the next queued buffer when the
    /// current window is exhausted.
    pub fn refill(&mut self) -> RefillResult {
        if self.errored {
            return RefillResult::Error;
        }
        if self.amount() > 0 {
            return RefillResult::Start;
        }
        if self.at_end {
            return RefillResult::Start;
        }
        match self.nextbuf() {
            None => RefillResult::Yield,
            Some(previous) => {
                if let Some(buf) = previous {
                    self.returns.produce(buf);
                }
                if self.errored {
                    RefillResult::Error
                } else {
                    RefillResult::Start
                }
            }
        }
    }

    pub fn pool(&self) -> &Arc<IoBufferPool> {
        &self.pool
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        if let Some(buf) = self.current.take() {
            self.returns.produce(buf);
        }
    }
}
