//! Notification fabric: per-path waiter registry that wakes long-poll and
//! SSE readers when an append lands.
//!
//! A waiter is single-use: it's registered with the offset it's waiting to
//! see data past, and is resolved exactly once, either by a matching
//! `notify` call or by its own timeout firing first. A `tokio::sync::oneshot`
//! channel gives us the single-assignment latch for free — sending after the
//! receiver already timed out and dropped is simply ignored.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::offset;
use crate::types::{StreamMessage, WaitResult};

struct Waiter {
    id: u64,
    /// Resolve only if a message with an offset strictly greater than this
    /// lands.
    offset: Option<String>,
    tx: oneshot::Sender<Vec<StreamMessage>>,
}

#[derive(Default)]
pub struct NotificationFabric {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl NotificationFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter on `path` for messages past `offset` (`None` means
    /// "any message at all", used when catching up from the very start of a
    /// brand new stream can still race with `offset=now`). Returns a
    /// receiver that resolves with the satisfying messages.
    fn register(&self, path: &str, offset: Option<String>) -> (u64, oneshot::Receiver<Vec<StreamMessage>>) {
        let (tx, rx) = oneshot::channel();
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.waiters
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(Waiter { id, offset, tx });
        (id, rx)
    }

    fn deregister(&self, path: &str, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(path) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                waiters.remove(path);
            }
        }
    }

    /// Wait for messages after `offset` on `path`, given the messages
    /// already known to be available right now (a `messages_after` callback
    /// so the fabric doesn't need to know about the store). Resolves
    /// immediately if `already_available` is non-empty.
    pub async fn wait(
        &self,
        path: &str,
        offset: Option<String>,
        already_available: Vec<StreamMessage>,
        timeout_duration: Duration,
    ) -> WaitResult {
        if !already_available.is_empty() {
            return WaitResult {
                messages: already_available,
                timed_out: false,
            };
        }

        let (id, rx) = self.register(path, offset);

        match timeout(timeout_duration, rx).await {
            Ok(Ok(messages)) if messages.is_empty() => {
                // Resolved with nothing: the stream was deleted or the
                // fabric was torn down out from under us. Indistinguishable
                // from a timeout to the caller.
                WaitResult {
                    messages,
                    timed_out: true,
                }
            }
            Ok(Ok(messages)) => WaitResult {
                messages,
                timed_out: false,
            },
            Ok(Err(_)) => {
                // Sender dropped without sending: treat as a cancellation.
                WaitResult {
                    messages: Vec::new(),
                    timed_out: true,
                }
            }
            Err(_) => {
                self.deregister(path, id);
                WaitResult {
                    messages: Vec::new(),
                    timed_out: true,
                }
            }
        }
    }

    /// Wake every waiter on `path` whose target offset is now satisfiable,
    /// given the full, current set of messages on the stream.
    pub fn notify(&self, path: &str, messages: &[StreamMessage]) {
        let mut waiters = self.waiters.lock();
        let Some(list) = waiters.get_mut(path) else {
            return;
        };

        list.retain_mut(|waiter| {
            let after: Vec<StreamMessage> = match &waiter.offset {
                None => messages.to_vec(),
                Some(o) => messages
                    .iter()
                    .filter(|m| offset::compare(&m.offset, o) == std::cmp::Ordering::Greater)
                    .cloned()
                    .collect(),
            };

            if after.is_empty() {
                // Nothing new for this waiter yet; keep it registered.
                return true;
            }

            // Ignore the send error: the waiter's receiver may already have
            // timed out and been dropped, racing with this notify.
            let tx = std::mem::replace(&mut waiter.tx, oneshot::channel().0);
            let _ = tx.send(after);
            false
        });

        if list.is_empty() {
            waiters.remove(path);
        }
    }

    /// Resolve every waiter on `path` with an empty result, e.g. because the
    /// stream was deleted.
    pub fn cancel_path(&self, path: &str) {
        if let Some(list) = self.waiters.lock().remove(path) {
            for waiter in list {
                let _ = waiter.tx.send(Vec::new());
            }
        }
    }

    /// Resolve every outstanding waiter across every path, e.g. at shutdown.
    pub fn cancel_all(&self) {
        let all: HashMap<String, Vec<Waiter>> = std::mem::take(&mut *self.waiters.lock());
        for (_, list) in all {
            for waiter in list {
                let _ = waiter.tx.send(Vec::new());
            }
        }
    }
}
