//! Concurrency helpers for the consumer.
//!
//! - [`KeyedSequencer`]: one-at-a-time processing per identity, while
//!   different identities proceed in parallel.
//! - [`InFlight`]: counts running handler tasks so shutdown can drain them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

/// Per-key turn order. Entries are removed once no ticket for the key is
/// outstanding.
#[derive(Default)]
pub struct KeyedSequencer {
    slots: Mutex<HashMap<String, Slot>>,
}

#[derive(Default)]
struct Slot {
    /// Fires when the most recently issued turn ends.
    tail: Option<oneshot::Receiver<()>>,
    tickets: usize,
}

impl KeyedSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a place in line for `key` without waiting. Turns are granted in
    /// the order tickets are issued.
    pub fn ticket(self: &Arc<Self>, key: &str) -> KeyTicket {
        let (done, next) = oneshot::channel();
        let mut slots = lock(&self.slots);
        let slot = slots.entry(key.to_string()).or_default();
        let previous = slot.tail.replace(next);
        slot.tickets += 1;
        KeyTicket {
            previous,
            turn: KeyTurn {
                sequencer: Arc::clone(self),
                key: key.to_string(),
                done: Some(done),
            },
        }
    }

    /// Wait for exclusive access to `key`.
    #[cfg(test)]
    pub async fn acquire(self: &Arc<Self>, key: &str) -> KeyTurn {
        self.ticket(key).wait().await
    }

    /// Number of keys with an outstanding ticket.
    #[cfg(test)]
    pub fn active_keys(&self) -> usize {
        lock(&self.slots).len()
    }

    fn release(&self, key: &str) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(key) {
            slot.tickets = slot.tickets.saturating_sub(1);
            if slot.tickets == 0 {
                slots.remove(key);
            }
        }
    }
}

/// A place in line on one key. Dropping it unwaited gives up the place.
pub struct KeyTicket {
    previous: Option<oneshot::Receiver<()>>,
    turn: KeyTurn,
}

impl KeyTicket {
    /// Wait until every earlier ticket on the key has finished its turn.
    pub async fn wait(self) -> KeyTurn {
        let KeyTicket { previous, turn } = self;
        if let Some(previous) = previous {
            // A closed sender also means the earlier turn is over.
            let _ = previous.await;
        }
        turn
    }
}

/// Exclusive turn on one key; released on drop.
pub struct KeyTurn {
    sequencer: Arc<KeyedSequencer>,
    key: String,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for KeyTurn {
    fn drop(&mut self) {
        self.sequencer.release(&self.key);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Counter of running handler tasks.
#[derive(Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running task until the returned guard drops.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no task is running, at most `limit`. Returns whether the
    /// tracker went idle in time.
    pub async fn drain(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }
}

pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
