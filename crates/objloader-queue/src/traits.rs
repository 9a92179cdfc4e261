use std::sync::Arc;

/// Sink for pipeline items.
///
/// `add` never blocks; producers that care about memory check
/// [`is_saturated`](Queue::is_saturated) and back off.
pub trait Queue<T>: Send + Sync {
    fn add(&self, item: T);

    /// No more items will be added.
    fn finish(&self) {}

    /// Backpressure signal.
    fn is_saturated(&self) -> bool {
        false
    }
}

impl<T, Q: Queue<T> + ?Sized> Queue<T> for Arc<Q> {
    fn add(&self, item: T) {
        (**self).add(item)
    }

    fn finish(&self) {
        (**self).finish()
    }

    fn is_saturated(&self) -> bool {
        (**self).is_saturated()
    }
}
