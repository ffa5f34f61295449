use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A resettable, latched broadcast signal.
///
/// `notify(value)` wakes every task currently parked in [`wait`](Self::wait)
/// and latches `value`, so later waiters return it immediately until
/// [`reset`](Self::reset) re-arms the signal. Waiters are never resolved by a
/// reset; they stay parked until the next `notify`.
///
/// Clones share the same signal.
pub struct AsyncNotify<T> {
    inner: Arc<Mutex<NotifyState<T>>>,
}

struct NotifyState<T> {
    value: Option<T>,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T> Clone for AsyncNotify<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for AsyncNotify<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> AsyncNotify<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NotifyState {
                value: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Wait for the next notification, or return the latched value if the
    /// signal has fired since the last reset.
    pub async fn wait(&self) -> T {
        let rx = {
            let mut state = self.inner.lock();
            if let Some(value) = &state.value {
                return value.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        match rx.await {
            Ok(value) => value,
            // Senders only leave the list by being fired, and `self` keeps the
            // list alive, so this arm is never taken. Stay parked if it is.
            Err(_) => std::future::pending().await,
        }
    }

    /// Latch `value` and wake all current waiters with it.
    pub fn notify(&self, value: T) {
        let mut state = self.inner.lock();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(value.clone());
        }
        state.value = Some(value);
    }

    /// Discard the latched value so a new wait/notify cycle can begin.
    pub fn reset(&self) {
        self.inner.lock().value = None;
    }

    pub fn is_notified(&self) -> bool {
        self.inner.lock().value.is_some()
    }
}
