use std::sync::Arc;
use crossbeam_queue::SegQueue;

/// An unbounded single-producer/single-consumer queue (§4.1), used for per-decoder read-result
/// delivery and for PIO's interval-delivery path. `SegQueue` is an MPSC-capable structure; using
/// it under a strict SPSC discipline (enforced by splitting into owned halves) just means we
/// don't exercise its multi-producer path.
pub struct UnboundedSpsc<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> UnboundedSpsc<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(SegQueue::new()) }
    }

    pub fn split(self) -> (UnboundedSpscProducer<T>, UnboundedSpscConsumer<T>) {
        (UnboundedSpscProducer { inner: self.inner.clone() }, UnboundedSpscConsumer { inner: self.inner })
    }
}

impl<T> Default for UnboundedSpsc<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct UnboundedSpscProducer<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> UnboundedSpscProducer<T> {
    pub fn produce(&self, value: T) {
        self.inner.push(value);
    }
}

pub struct UnboundedSpscConsumer<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> UnboundedSpscConsumer<T> {
    pub fn try_consume(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let (p, c) = UnboundedSpsc::new().split();
        for i in 0..100 {
            p.produce(i);
        }
        for i in 0..100 {
            assert_eq!(c.try_consume(), Some(i));
        }
        assert!(c.is_empty());
    }
}
