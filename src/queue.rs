use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Bounded multi-consumer queue between the receive worker and the batch
/// processors.
///
/// `try_push` never waits: a full queue hands the item back so the caller
/// can shed it. `pop_timeout` waits up to a deadline. The internal lock is
/// only held for the push/pop itself, never across a suspension point.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        BoundedQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Insert without waiting. Returns the item back when the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait up to `wait` for an item.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        self.pop_until(Instant::now() + wait).await
    }

    pub async fn pop_until(&self, deadline: Instant) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                // Another waiter may be parked on an item we did not take.
                if !self.is_empty() {
                    self.available.notify_one();
                }
                return Some(item);
            }

            if timeout_at(deadline, &mut notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = BoundedQueue::new(1);
        assert!(queue.try_push(1).is_ok());
        assert_eq!(queue.try_push(2), Err(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_when_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_secs(1)).await, None);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_push() {
        let queue = Arc::new(BoundedQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.try_push("hello").unwrap();
        assert_eq!(waiter.await.unwrap(), Some("hello"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn multiple_consumers_drain_everything_once() {
        let queue = Arc::new(BoundedQueue::new(1000));
        for i in 0..500 {
            queue.try_push(i).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(i) = queue.pop_timeout(Duration::from_millis(50)).await {
                    got.push(i);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
    }
}
