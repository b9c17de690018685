//! Bounded queues that never block the producer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Bounded FIFO that evicts its oldest item to make room. Used for frames:
/// a fresh frame is always worth more than a stale one.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    // Kept to evict from the head; workers hold clones of it.
    rx: Receiver<T>,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Enqueue without blocking. Returns the number of evicted items.
    pub fn push(&self, mut item: T) -> usize {
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                // Unreachable while `self.rx` lives.
                Err(TrySendError::Disconnected(_)) => return evicted + 1,
            }
        }
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Remove everything queued, returning how many items were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Outcome of [`TaskQueue::push`].
#[derive(Debug, PartialEq)]
pub enum PushOutcome<T> {
    Accepted,
    /// Queue was full; this lower-priority item was evicted.
    Evicted(T),
    /// Queue was full of items at least as urgent; the new item was refused.
    Rejected(T),
    Closed(T),
}

struct Entry<P, T> {
    priority: P,
    seq: u64,
    item: T,
}

impl<P: Ord, T> PartialEq for Entry<P, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P: Ord, T> Eq for Entry<P, T> {}

impl<P: Ord, T> PartialOrd for Entry<P, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Ord, T> Ord for Entry<P, T> {
    /// Higher priority first, then FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TaskState<P, T> {
    heap: BinaryHeap<Entry<P, T>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded priority queue for model tasks. When full, the least urgent
/// (and among equals, the newest) entry is the one dropped.
pub struct TaskQueue<P, T> {
    state: Mutex<TaskState<P, T>>,
    available: Condvar,
    capacity: usize,
}

impl<P: Ord, T> TaskQueue<P, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TaskState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState<P, T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, priority: P, item: T) -> PushOutcome<T> {
        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed(item);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = Entry {
            priority,
            seq,
            item,
        };

        let outcome = if state.heap.len() < self.capacity {
            state.heap.push(entry);
            PushOutcome::Accepted
        } else {
            let mut entries = std::mem::take(&mut state.heap).into_vec();
            // `entries` is non-empty: capacity is at least 1.
            let lowest = entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.cmp(b))
                .map_or(0, |(i, _)| i);
            let outcome = if entry.priority > entries[lowest].priority {
                let evicted = entries.swap_remove(lowest);
                entries.push(entry);
                PushOutcome::Evicted(evicted.item)
            } else {
                PushOutcome::Rejected(entry.item)
            };
            state.heap = BinaryHeap::from(entries);
            outcome
        };
        drop(state);
        if matches!(outcome, PushOutcome::Accepted | PushOutcome::Evicted(_)) {
            self.available.notify_one();
        }
        outcome
    }

    /// Wait up to `timeout` for the most urgent item. `None` on timeout or
    /// once the queue is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.heap.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.heap.pop().map(|e| e.item)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().heap.pop().map(|e| e.item)
    }

    /// Refuse new items and wake every waiting worker. Queued items can
    /// still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove every queued item.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        std::mem::take(&mut state.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|e| e.item)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_drop_oldest() {
        let queue = DropOldestQueue::new(2);
        assert_eq!(queue.push(1), 0);
        assert_eq!(queue.push(2), 0);
        assert_eq!(queue.push(3), 1);
        let rx = queue.receiver();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_priority_order_and_fifo() {
        let queue = TaskQueue::new(8);
        queue.push(1, "low");
        queue.push(3, "high-a");
        queue.push(2, "mid");
        queue.push(3, "high-b");
        let order: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(order, vec!["high-a", "high-b", "mid", "low"]);
    }

    #[test]
    fn test_saturation_drops_lowest() {
        let queue = TaskQueue::new(2);
        assert_eq!(queue.push(2, "a"), PushOutcome::Accepted);
        assert_eq!(queue.push(1, "b"), PushOutcome::Accepted);
        assert_eq!(queue.push(3, "c"), PushOutcome::Evicted("b"));
        assert_eq!(queue.push(2, "d"), PushOutcome::Rejected("d"));
        assert_eq!(queue.drain(), vec!["c", "a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_wakes_waiters() {
        let queue: Arc<TaskQueue<u8, u8>> = Arc::new(TaskQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert_eq!(queue.push(1, 1), PushOutcome::Closed(1));
    }
}
