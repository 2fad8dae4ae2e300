//! Bounded event buffer with a fixed flush deadline.
//!
//! The first push into an empty queue arms a deadline `interval` in the
//! future. Later pushes never move it, so a steady stream of events is still
//! flushed at least once per interval. A queue that reaches `capacity` is due
//! immediately. Batches always come out in push order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct CoalescingQueue<T> {
    items: VecDeque<T>,
    interval: Duration,
    capacity: usize,
    deadline: Option<Instant>,
}

impl<T> CoalescingQueue<T> {
    pub fn new(interval: Duration, capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            interval,
            capacity: capacity.max(1),
            deadline: None,
        }
    }

    pub fn push(&mut self, item: T, now: Instant) {
        if self.items.is_empty() {
            self.deadline = Some(now + self.interval);
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// When the pending batch should be flushed, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        if self.items.len() >= self.capacity {
            return Some(Instant::now().min(self.deadline.unwrap_or_else(Instant::now)));
        }
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.items.is_empty() {
            return false;
        }
        self.items.len() >= self.capacity || self.deadline.is_some_and(|d| d <= now)
    }

    /// Drains everything pending and disarms the deadline.
    pub fn take_batch(&mut self) -> Vec<T> {
        self.deadline = None;
        self.items.drain(..).collect()
    }

    /// Drops items that fail `keep`; disarms the deadline if nothing is left.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.items.retain(keep);
        if self.items.is_empty() {
            self.deadline = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn deadline_is_armed_by_the_first_push_only() {
        let mut queue = CoalescingQueue::new(INTERVAL, 16);
        let start = Instant::now();
        assert!(queue.deadline().is_none());

        queue.push(1, start);
        tokio::time::advance(Duration::from_millis(150)).await;
        queue.push(2, Instant::now());

        assert_eq!(queue.deadline(), Some(start + INTERVAL));
        assert!(!queue.is_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(queue.is_due(Instant::now()));
        assert_eq!(queue.take_batch(), vec![1, 2]);
        assert!(queue.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_is_due_at_once() {
        let mut queue = CoalescingQueue::new(INTERVAL, 2);
        let now = Instant::now();
        queue.push("a", now);
        assert!(!queue.is_due(now));
        queue.push("b", now);
        assert!(queue.is_due(now));
        assert!(queue.deadline().is_some_and(|d| d <= Instant::now()));
    }

    #[test]
    fn empty_queue_is_never_due_and_yields_empty_batches() {
        let mut queue: CoalescingQueue<u8> = CoalescingQueue::new(INTERVAL, 4);
        let now = Instant::now();
        assert!(!queue.is_due(now + INTERVAL));
        assert!(queue.take_batch().is_empty());
        assert!(queue.take_batch().is_empty());
    }

    #[test]
    fn retain_disarms_when_everything_is_dropped() {
        let mut queue = CoalescingQueue::new(INTERVAL, 8);
        let now = Instant::now();
        queue.push((1, 'a'), now);
        queue.push((2, 'b'), now);
        queue.push((1, 'c'), now);

        queue.retain(|(turn, _)| *turn == 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.deadline().is_some());

        queue.retain(|_| false);
        assert!(queue.is_empty());
        assert!(queue.deadline().is_none());
    }
}
