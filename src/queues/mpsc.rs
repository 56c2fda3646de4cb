use std::{
    sync::Arc,
    collections::HashMap,
};
use crossbeam_queue::SegQueue;

/// An unbounded multi-producer/single-consumer queue (§4.1). This is the input queue shape for
/// every long-lived service: cache declaration/definition/location/command queues, the loader's
/// request queue, and buffer return queues.
pub struct UnboundedMpsc<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> UnboundedMpsc<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(SegQueue::new()) }
    }

    /// Returns a cloneable producer handle. Cloning is cheap (an `Arc` bump); per §4.1, each
    /// producing thread is expected to cache its own handle rather than re-deriving one per send.
    pub fn producer(&self) -> MpscProducer<T> {
        MpscProducer { inner: self.inner.clone() }
    }

    pub fn try_consume(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Drains all currently-queued items, applying `f` to each, matching the "drain the MPSC
    /// queue" step repeated throughout the PIO/loader/cache tick algorithms.
    pub fn drain(&self, mut f: impl FnMut(T)) {
        while let Some(item) = self.inner.pop() {
            f(item);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<T> Default for UnboundedMpsc<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct MpscProducer<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> MpscProducer<T> {
    pub fn produce(&self, value: T) {
        self.inner.push(value);
    }

    /// Identity of the underlying queue, stable for the queue's lifetime. Used as the key in
    /// [`AllocatorTable`], and by callers that need to de-duplicate a set of producers by the
    /// queue they ultimately target (e.g. the cache's pending-load waiter queue sets, §4.10).
    pub(crate) fn target_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

/// Lazily caches one producer handle per distinct target queue (§4.1): "An allocator table keyed
/// by target queue pointer exists so that a consumer that posts results to many client queues
/// creates one producer-allocator per distinct target, lazily." Used by the cache and loader,
/// which fan results out to whichever queues clients registered for a given lock/load request.
pub struct AllocatorTable<T> {
    producers: HashMap<usize, MpscProducer<T>>,
}

impl<T> AllocatorTable<T> {
    pub fn new() -> Self {
        Self { producers: HashMap::new() }
    }

    /// Returns the cached producer for `queue`, creating and caching one on first use.
    pub fn get_or_insert(&mut self, queue: &UnboundedMpsc<T>) -> &MpscProducer<T> {
        let producer = queue.producer();
        self.producers.entry(producer.target_id()).or_insert(producer)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl<T> Default for AllocatorTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
