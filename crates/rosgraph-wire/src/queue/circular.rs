//! Bounded FIFO that evicts its oldest entry instead of blocking producers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Returned by [`CircularBuffer::push`] when an unread entry was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOverflowNotice {
    /// Number of entries evicted by this insertion.
    pub evicted: usize,
    /// Capacity at the time of insertion.
    pub limit: usize,
}

/// Single-consumer bounded buffer.
#[derive(Debug)]
pub struct CircularBuffer<T> {
    items: Mutex<VecDeque<T>>,
    limit: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> CircularBuffer<T> {
    /// A buffer holding at most `limit` entries (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit: AtomicUsize::new(limit),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Append `item`, evicting the oldest entries if the buffer is full.
    ///
    /// Never blocks. Items pushed after [`CircularBuffer::close`] are dropped.
    pub fn push(&self, item: T) -> Option<QueueOverflowNotice> {
        if self.is_closed() {
            return None;
        }
        let limit = self.limit();
        let mut evicted = 0;
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            while items.len() >= limit {
                items.pop_front();
                evicted += 1;
            }
            items.push_back(item);
        }
        self.notify.notify_one();
        (evicted > 0).then_some(QueueOverflowNotice { evicted, limit })
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait for the next entry; `None` once the buffer is closed.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Change the capacity, dropping the oldest entries if over the new
    /// limit. Returns how many were dropped.
    pub fn set_limit(&self, limit: usize) -> usize {
        let limit = limit.max(1);
        self.limit.store(limit, Ordering::Release);
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let excess = items.len().saturating_sub(limit);
        items.drain(..excess);
        excess
    }

    /// Drop pending entries and wake the consumer; later pops return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_overflow_evicts_oldest() {
        let buffer = CircularBuffer::new(3);
        assert!(buffer.push(1).is_none());
        assert!(buffer.push(2).is_none());
        assert!(buffer.push(3).is_none());
        assert_eq!(
            buffer.push(4),
            Some(QueueOverflowNotice {
                evicted: 1,
                limit: 3
            })
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.try_pop(), Some(2));
        assert_eq!(buffer.try_pop(), Some(3));
        assert_eq!(buffer.try_pop(), Some(4));
        assert_eq!(buffer.try_pop(), None);
    }

    #[test]
    fn test_never_grows_past_limit() {
        let buffer = CircularBuffer::new(8);
        for i in 0..10_000 {
            buffer.push(i);
            assert!(buffer.len() <= 8);
        }
        assert_eq!(buffer.try_pop(), Some(9_992));
    }

    #[test]
    fn test_set_limit_truncates_oldest() {
        let buffer = CircularBuffer::new(5);
        for i in 0..5 {
            buffer.push(i);
        }
        assert_eq!(buffer.set_limit(2), 3);
        assert_eq!(buffer.limit(), 2);
        assert_eq!(buffer.try_pop(), Some(3));
        assert_eq!(buffer.try_pop(), Some(4));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let buffer = Arc::new(CircularBuffer::new(4));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push("hello");
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some("hello"));
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let buffer: Arc<CircularBuffer<u32>> = Arc::new(CircularBuffer::new(4));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
        assert!(buffer.push(1).is_none());
        assert!(buffer.is_empty());
    }
}
