//! Bounded command queue with a reactor wakeup.
//!
//! Producers on any thread push and then signal; the reactor drains the whole
//! queue on each wakeup, so no item is ever observed twice. When the queue is
//! full, producers block until the reactor makes room; nothing is dropped.

use crate::util::{Result, TunnelError};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;

struct State<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

pub(crate) struct CommandQueue<T> {
    state: Mutex<State<T>>,
    space: Condvar,
    wake: Notify,
    capacity: usize,
}

impl<T> CommandQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            space: Condvar::new(),
            wake: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Push from a producer thread, blocking while the queue is full.
    pub(crate) fn push(&self, item: T) -> Result<()> {
        let mut state = self.lock();
        while state.items.len() >= self.capacity && !state.shutdown {
            state = self.space.wait(state).unwrap_or_else(|err| err.into_inner());
        }
        if state.shutdown {
            return Err(TunnelError::Closed);
        }
        state.items.push_back(item);
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Push from the reactor itself. Skips the capacity wait: the reactor is
    /// the only consumer and must never block against its own drain.
    pub(crate) fn push_from_reactor(&self, item: T) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        state.items.push_back(item);
        drop(state);
        self.wake.notify_one();
    }

    /// Ask the reactor to stop after its next drain. Unblocks any producer
    /// stuck on a full queue; later pushes fail with [`TunnelError::Closed`].
    pub(crate) fn request_shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        drop(state);
        self.space.notify_all();
        self.wake.notify_one();
    }

    /// Take every queued item plus the shutdown flag.
    pub(crate) fn take_all(&self) -> (Vec<T>, bool) {
        let mut state = self.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        let shutdown = state.shutdown;
        drop(state);
        if !items.is_empty() {
            self.space.notify_all();
        }
        (items, shutdown)
    }

    /// Park until the next push or shutdown request. A push that lands before
    /// this call stores a permit, so the wakeup is never lost.
    pub(crate) async fn wakeup(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_fifo_order_and_full_drain() {
        let queue = CommandQueue::new(8);
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        let (items, shutdown) = queue.take_all();
        assert_eq!(items, vec![1, 2, 3]);
        assert!(!shutdown);

        let (items, _) = queue.take_all();
        assert!(items.is_empty());
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let queue = Arc::new(CommandQueue::new(2));
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            std::thread::spawn(move || {
                queue.push(3).unwrap();
                pushed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!pushed.load(Ordering::SeqCst), "push should block while full");

        let (items, _) = queue.take_all();
        assert_eq!(items, vec![1, 2]);

        producer.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        let (items, _) = queue.take_all();
        assert_eq!(items, vec![3]);
    }

    #[test]
    fn test_shutdown_rejects_and_unblocks() {
        let queue = Arc::new(CommandQueue::new(1));
        queue.push(1u32).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(2))
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.request_shutdown();
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(TunnelError::Closed)));

        assert!(matches!(queue.push(3), Err(TunnelError::Closed)));
        let (items, shutdown) = queue.take_all();
        assert_eq!(items, vec![1]);
        assert!(shutdown);
    }

    #[tokio::test]
    async fn test_push_stores_wakeup_permit() {
        let queue = CommandQueue::new(4);
        queue.push(7u32).unwrap();
        tokio::time::timeout(Duration::from_millis(100), queue.wakeup())
            .await
            .expect("wakeup should fire for a push that happened first");
    }
}
