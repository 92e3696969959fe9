use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A bounded-wait FIFO shared between request producers and worker threads.
///
/// Once `kill_waiters` is called, every current and future `dequeue` returns
/// `None` immediately; there is no way to revive a dead queue.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    condvar: Condvar,
    alive: Mutex<bool>,
}

impl<T> WorkQueue<T> {
    pub fn new() -> WorkQueue<T> {
        WorkQueue {
            items: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            alive: Mutex::new(true),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.condvar.notify_one();
    }

    /// Waits up to `timeout` for an item. Returns `None` on timeout or if the
    /// queue has been killed.
    pub fn dequeue(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        loop {
            if !*self.alive.lock().unwrap() {
                return None;
            }
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let (guard, result) = self.condvar.wait_timeout(items, timeout).unwrap();
            items = guard;
            if result.timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Marks the queue dead and wakes every waiter. Idempotent.
    pub fn kill_waiters(&self) {
        *self.alive.lock().unwrap() = false;
        self.condvar.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue::new()
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.kill_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_enqueue_then_dequeue_fifo_order() {
        let queue: WorkQueue<i32> = WorkQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        assert_eq!(queue.dequeue(Duration::from_millis(10)), Some(1));
        assert_eq!(queue.dequeue(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn test_dequeue_times_out_when_empty() {
        let queue: WorkQueue<i32> = WorkQueue::new();
        assert_eq!(queue.dequeue(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_kill_waiters_wakes_blocked_dequeue() {
        let queue = Arc::new(WorkQueue::<i32>::new());
        let blocked = Arc::clone(&queue);
        let handle = thread::spawn(move || blocked.dequeue(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(50));
        queue.kill_waiters();

        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_dequeue_after_kill_returns_none_immediately() {
        let queue: WorkQueue<i32> = WorkQueue::new();
        queue.kill_waiters();
        assert_eq!(queue.dequeue(Duration::from_secs(30)), None);
    }
}
