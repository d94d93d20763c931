//! Single-flight coordination of fetch passes
//!
//! Coalesces concurrent callers onto one underlying computation: the first
//! caller becomes the leader and runs the work inside its own future, every
//! other caller waits on a watch channel for the leader's cloned result.
//! Because the work is polled by the leader, dropping the leader's future
//! cancels the shared computation; a follower that is dropped merely stops
//! waiting. Followers that observe a leader vanishing without a published
//! value elect a new leader among themselves.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

type Slot<T> = Mutex<Option<watch::Receiver<Option<T>>>>;

/// Coalesces concurrent invocations of one logical operation.
pub(crate) struct SingleFlight<T> {
    inflight: Slot<T>,
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(None),
        }
    }

    /// Runs `work`, or waits for the in-flight run started by another caller.
    pub(crate) async fn run<F, Fut>(&self, work: F) -> T
    where
        F: Fn() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let role = {
                let mut slot = self.inflight.lock();
                match slot.as_ref() {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    // Clears the slot even if this future is dropped mid-work,
                    // waking followers to elect a new leader.
                    let _clear = ClearSlot { slot: &self.inflight };
                    let out = work().await;
                    let _ = tx.send(Some(out.clone()));
                    return out;
                }
                Role::Follower(mut rx) => {
                    loop {
                        let published: Option<T> = rx.borrow_and_update().clone();
                        if let Some(out) = published {
                            return out;
                        }
                        if rx.changed().await.is_err() {
                            // Leader gone without publishing; race for the slot.
                            break;
                        }
                    }
                }
            }
        }
    }
}

struct ClearSlot<'a, T> {
    slot: &'a Slot<T>,
}

impl<T> Drop for ClearSlot<'_, T> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}
