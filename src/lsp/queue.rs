//! Unbounded FIFO queue with a suspending dequeue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;
use tokio::sync::Notify;

/// Unbounded FIFO buffer shared between producers and one consumer.
///
/// `enqueue` never blocks. `dequeue` waits until an item is available. Each
/// item goes to exactly one `dequeue` call, so a queue is meant to be drained
/// by a single loop.
pub struct AsyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
    high_watermark: Option<usize>,
    over_watermark: AtomicBool,
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            high_watermark: None,
            over_watermark: AtomicBool::new(false),
        }
    }

    /// Create a queue that warns whenever its backlog grows past `limit`.
    ///
    /// The queue stays unbounded; producers are never held back.
    pub fn with_high_watermark(limit: usize) -> Self {
        Self {
            high_watermark: Some(limit),
            ..Self::new()
        }
    }

    pub fn enqueue(&self, item: T) {
        let backlog = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.push_back(item);
            items.len()
        };
        self.check_watermark(backlog);
        self.available.notify_one();
    }

    /// Remove the oldest item, waiting for one if the queue is empty.
    pub async fn dequeue(&self) -> T {
        loop {
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            // A permit stored by an enqueue that raced with the check above
            // wakes this immediately.
            self.available.notified().await;
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let item = items.pop_front();
        let backlog = items.len();
        drop(items);
        self.check_watermark(backlog);
        item
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_watermark(&self, backlog: usize) {
        let Some(limit) = self.high_watermark else {
            return;
        };
        if backlog > limit {
            if !self.over_watermark.swap(true, Ordering::Relaxed) {
                warn!(
                    target: "demo_lsp_client::queue",
                    "queue backlog {} exceeds high watermark {}",
                    backlog,
                    limit
                );
            }
        } else {
            self.over_watermark.store(false, Ordering::Relaxed);
        }
    }
}
