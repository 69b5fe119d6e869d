//! Coalescing, rate limited delivery of status requests.
//!
//! Each session owns one [`ThrottledDispatchQueue`]. Offers land in a single
//! slot that always holds the most recent token; a background task waits for
//! the slot to fill, lets one throttling interval pass so that a burst
//! collapses, then hands the latest token to the delivery callback. Two
//! deliveries of the same queue are therefore never closer than one interval.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Slot<T> {
    pending: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Slot<T> {
    fn put(&self, token: T) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<T> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Single consumer queue where only the latest offered token matters.
///
/// `OPEN -> CLOSED`, there is no way back. Dropping the queue closes it.
pub struct ThrottledDispatchQueue<T> {
    slot: Arc<Slot<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> ThrottledDispatchQueue<T> {
    /// Spawns the delivery loop on the current tokio runtime.
    ///
    /// `cancel` is typically a child of the owning session's token so that
    /// tearing the session down also stops the loop.
    pub fn spawn<F>(interval: Duration, cancel: CancellationToken, deliver: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let slot = Arc::new(Slot {
            pending: Mutex::new(None),
            notify: Notify::new(),
        });

        tokio::spawn(delivery_loop(
            Arc::clone(&slot),
            interval,
            cancel.clone(),
            deliver,
        ));

        Self { slot, cancel }
    }

    /// Replaces whatever token is pending. Returns `false` if the queue is
    /// already closed, in which case the token is dropped.
    pub fn offer(&self, token: T) -> bool {
        if self.cancel.is_cancelled() {
            tracing::trace!("offer on closed throttling queue dropped");
            return false;
        }
        self.slot.put(token);
        true
    }

    /// Stops accepting tokens. A delivery already running completes.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Drop for ThrottledDispatchQueue<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn delivery_loop<T, F>(
    slot: Arc<Slot<T>>,
    interval: Duration,
    cancel: CancellationToken,
    mut deliver: F,
) where
    F: FnMut(T),
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = slot.notify.notified() => {}
        }

        // Coalescing window, anything offered until it ends supersedes the
        // token that woke us up.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if let Some(token) = slot.take() {
            deliver(token);
        }
    }
    tracing::trace!("throttling queue closed");
}
