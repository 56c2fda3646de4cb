use std::sync::Arc;
use crossbeam_queue::ArrayQueue;

/// A bounded, fixed-capacity single-producer/single-consumer queue (§4.1). Capacity must be a
/// power of two; this is asserted rather than silently rounded, because callers (the AIO command
/// queue) size it to match `MAX_ACTIVE` and a silent rounding would desynchronize backpressure
/// expectations.
pub struct BoundedSpsc<T> {
    inner: Arc<ArrayQueue<T>>,
}

impl<T> BoundedSpsc<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "BoundedSpsc capacity must be a power of two");
        Self { inner: Arc::new(ArrayQueue::new(capacity)) }
    }

    /// Splits the queue into single-owner producer/consumer halves, enforcing the SPSC contract
    /// at the type level.
    pub fn split(self) -> (BoundedSpscProducer<T>, BoundedSpscConsumer<T>) {
        (BoundedSpscProducer { inner: self.inner.clone() }, BoundedSpscConsumer { inner: self.inner })
    }
}

pub struct BoundedSpscProducer<T> {
    inner: Arc<ArrayQueue<T>>,
}

impl<T> BoundedSpscProducer<T> {
    /// Attempts to enqueue `value`. Returns it back on failure (queue full).
    pub fn try_produce(&self, value: T) -> Result<(), T> {
        self.inner.push(value)
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct BoundedSpscConsumer<T> {
    inner: Arc<ArrayQueue<T>>,
}

impl<T> BoundedSpscConsumer<T> {
    pub fn try_consume(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_capacity() {
        let (p, c) = BoundedSpsc::new(2).split();
        assert!(p.try_produce(1).is_ok());
        assert!(p.try_produce(2).is_ok());
        assert_eq!(p.try_produce(3), Err(3));
        assert_eq!(c.try_consume(), Some(1));
        assert_eq!(c.try_consume(), Some(2));
        assert_eq!(c.try_consume(), None);
    }

    #[test]
    fn fifo_order_preserved() {
        let (p, c) = BoundedSpsc::new(8).split();
        for i in 0..8 {
            p.try_produce(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(c.try_consume(), Some(i));
        }
    }
}
