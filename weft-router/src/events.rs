//! Per-subscriber event queues.
//!
//! Each subscriber owns an independent bounded queue: a slow subscriber
//! never blocks the distributor or its peers. On overflow the oldest event
//! is dropped; dropping the [`EventStream`] closes the queue so the
//! distributor can reap it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::message::RouterEvent;

pub(crate) struct EventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

struct QueueState {
    items: VecDeque<RouterEvent>,
    last_drain: Instant,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(EventQueue {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                last_drain: Instant::now(),
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue one event; returns true if an older event was dropped to make
    /// room.
    pub(crate) fn push(&self, event: RouterEvent) -> bool {
        let overflowed = {
            let mut state = self.state.lock().unwrap();
            let overflowed = state.items.len() >= self.capacity;
            if overflowed {
                state.items.pop_front();
            }
            state.items.push_back(event);
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    pub(crate) async fn pop(&self) -> Option<RouterEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(event) = state.items.pop_front() {
                    state.last_drain = Instant::now();
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How long since the subscriber last drained an event.
    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.state.lock().unwrap().last_drain.elapsed()
    }

    /// True if events are queued and waiting.
    pub(crate) fn has_backlog(&self) -> bool {
        !self.state.lock().unwrap().items.is_empty()
    }
}

/// A lazy sequence of router events, one per subscriber.
///
/// Dropping the stream cancels the subscription.
pub struct EventStream {
    queue: Arc<EventQueue>,
}

impl EventStream {
    pub(crate) fn new(queue: Arc<EventQueue>) -> Self {
        EventStream { queue }
    }

    /// The next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        self.queue.pop().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EventKind, JsonMap};

    fn event() -> RouterEvent {
        RouterEvent::new(EventKind::TopologyChanged, JsonMap::new())
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let queue = EventQueue::new(4);
        let mut first = event();
        first.data.insert("n".into(), 1.into());
        let mut second = event();
        second.data.insert("n".into(), 2.into());

        queue.push(first.clone());
        queue.push(second.clone());

        assert_eq!(queue.pop().await, Some(first));
        assert_eq!(queue.pop().await, Some(second));
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest() {
        let queue = EventQueue::new(2);
        for n in 0..3i64 {
            let mut e = event();
            e.data.insert("n".into(), n.into());
            let overflowed = queue.push(e);
            assert_eq!(overflowed, n == 2);
        }

        let survivor = queue.pop().await.unwrap();
        assert_eq!(survivor.data.get("n"), Some(&1.into()));
    }

    #[tokio::test]
    async fn close_wakes_pending_pop() {
        let queue = EventQueue::new(2);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
