use std::marker::PhantomData;

use crate::traits::Queue;

/// Fans every item out to two queues.
///
/// The primary queue is what the consumer reads; the secondary persists.
/// Only the primary is finished; backpressure comes from the secondary, so a
/// slow store slows the producer down instead of growing memory.
pub struct AggregateQueue<T, P, S> {
    primary: P,
    secondary: S,
    _item: PhantomData<fn(T)>,
}

impl<T, P, S> AggregateQueue<T, P, S>
where
    T: Clone,
    P: Queue<T>,
    S: Queue<T>,
{
    pub fn new(primary: P, secondary: S) -> Self {
        Self {
            primary,
            secondary,
            _item: PhantomData,
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }
}

impl<T, P, S> Queue<T> for AggregateQueue<T, P, S>
where
    T: Clone,
    P: Queue<T>,
    S: Queue<T>,
{
    fn add(&self, item: T) {
        self.primary.add(item.clone());
        self.secondary.add(item);
    }

    fn finish(&self) {
        self.primary.finish();
    }

    fn is_saturated(&self) -> bool {
        self.secondary.is_saturated()
    }
}
