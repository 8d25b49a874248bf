//! Observer lists for transport events.
//!
//! Dispatch is synchronous on whichever context produced the event (the
//! device reader thread, a tokio task, or the caller of `connect`). Each
//! observer runs in isolation: an `Err` or a panic is logged and the next
//! observer still runs. Consumers with slow work should register
//! [`forward_to`] and do that work on their own task.

use log::{debug, error};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A registered callback.
pub type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

pub struct Observers<T> {
    label: &'static str,
    callbacks: RwLock<Vec<Callback<T>>>,
}

impl<T> Observers<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, callback: Callback<T>) {
        self.callbacks.write().push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer registered at the time of the call.
    /// Returns how many observers failed.
    pub fn dispatch(&self, event: &T) -> usize {
        // Snapshot so observers may register further observers without deadlocking.
        let snapshot: Vec<Callback<T>> = self.callbacks.read().clone();
        let mut failures = 0;
        for (idx, callback) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("{} observer #{} failed: {:#}", self.label, idx, e);
                }
                Err(panic) => {
                    failures += 1;
                    error!(
                        "{} observer #{} panicked: {}",
                        self.label,
                        idx,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        if failures > 0 {
            debug!(
                "{} dispatch finished with {}/{} failing observers",
                self.label,
                failures,
                snapshot.len()
            );
        }
        failures
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Observer that hands each event to a bounded channel without blocking.
/// A full or closed channel counts as an observer failure.
pub fn forward_to<T>(tx: mpsc::Sender<T>) -> Callback<T>
where
    T: Clone + Send + 'static,
{
    Arc::new(move |event: &T| match tx.try_send(event.clone()) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(anyhow::anyhow!("event queue is full, event dropped")),
        Err(TrySendError::Closed(_)) => Err(anyhow::anyhow!("event queue is closed")),
    })
}
