use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Deduplicating queue of object keys.
///
/// Repeated adds of a key that is still pending collapse into one entry, so a
/// burst of watch events for the same object results in a single drain. Keys
/// are drained by a single worker task per queue; `get` blocks until a key is
/// available or the queue is shut down.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    queue: VecDeque<String>,
    pending: HashSet<String>,
    shut_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        WorkQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                pending: HashSet::new(),
                shut_down: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down || !inner.pending.insert(key.clone()) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-enqueues `key` after `delay`. Used for grace-pending nodes so the
    /// drain task is not spun for the whole not-ready window.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Returns the next key, or `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.pending.remove(&key);
                    return Some(key);
                }
                if inner.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting keys and wakes the drain task. Keys still queued are
    /// dropped; the drain task sees `None` on its next `get`.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shut_down = true;
        inner.queue.clear();
        inner.pending.clear();
        drop(inner);
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}
