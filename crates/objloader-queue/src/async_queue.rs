use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::traits::Queue;

struct AsyncState<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// Unbounded single-consumer queue with an async `next`.
///
/// This is the consumer-facing end of the pipeline: producers `add`, the
/// loader awaits [`next`](AsyncQueue::next) until the queue is finished and
/// drained.
pub struct AsyncQueue<T> {
    state: Mutex<AsyncState<T>>,
    notify: Notify,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AsyncState {
                items: VecDeque::new(),
                finished: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Next item, or `None` once finished and empty.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("lock poisoned");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().expect("lock poisoned").finished
    }

    /// Finish and drop anything not yet consumed.
    pub fn dispose(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.items.clear();
        state.finished = true;
        drop(state);
        self.notify.notify_one();
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for AsyncQueue<T> {
    fn add(&self, item: T) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.finished {
            debug!("add after finish; dropping item");
            return;
        }
        state.items.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    fn finish(&self) {
        self.state.lock().expect("lock poisoned").finished = true;
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn yields_in_order_then_none() {
        let queue = AsyncQueue::new();
        queue.add(1);
        queue.add(2);
        queue.finish();
        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, Some(2));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn next_waits_for_producer() {
        let queue = Arc::new(AsyncQueue::new());
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.add("late");
            producer.finish();
        });
        assert_eq!(queue.next().await, Some("late"));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn adds_after_finish_are_ignored() {
        let queue = AsyncQueue::new();
        queue.finish();
        queue.add(5);
        assert!(queue.is_empty());
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn dispose_drops_pending_items() {
        let queue = AsyncQueue::new();
        queue.add(1);
        queue.dispose();
        assert_eq!(queue.next().await, None);
    }
}
