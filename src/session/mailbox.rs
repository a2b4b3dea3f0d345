//! Single-slot input mailbox
//!
//! A turn loop waits for the next input through [`InputMailbox::recv`].
//! If a receiver is already waiting, [`InputMailbox::send`] hands the value
//! over directly. Otherwise the value is parked in one slot, overwriting
//! (and discarding) any earlier value nobody has consumed yet.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Outcome of [`InputMailbox::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A waiting receiver took the value
    Delivered,
    /// Parked in the slot; `replaced` is true if an earlier value was discarded
    Queued { replaced: bool },
    /// The mailbox is closed and the value was dropped
    Closed,
}

#[derive(Debug)]
struct State<T> {
    slot: Option<T>,
    waiter: Option<oneshot::Sender<T>>,
    closed: bool,
}

/// Capacity-one, last-write-wins mailbox with a has-waiter flag
#[derive(Debug)]
pub struct InputMailbox<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for InputMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InputMailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slot: None,
                waiter: None,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a value to the waiting receiver, or park it in the slot
    pub fn send(&self, value: T) -> Delivery {
        let mut state = self.lock();
        if state.closed {
            return Delivery::Closed;
        }

        let value = match state.waiter.take() {
            Some(waiter) => match waiter.send(value) {
                Ok(()) => return Delivery::Delivered,
                // Receiver went away; keep the value for the next one
                Err(value) => value,
            },
            None => value,
        };

        let replaced = state.slot.replace(value).is_some();
        Delivery::Queued { replaced }
    }

    /// Wait for the next value
    ///
    /// Returns `None` once the mailbox is closed.
    pub async fn recv(&self) -> Option<T> {
        let rx = {
            let mut state = self.lock();
            if let Some(value) = state.slot.take() {
                return Some(value);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            rx
        };

        rx.await.ok()
    }

    /// Whether a receiver is currently suspended in [`recv`](Self::recv)
    pub fn has_waiter(&self) -> bool {
        self.lock()
            .waiter
            .as_ref()
            .is_some_and(|waiter| !waiter.is_closed())
    }

    /// Whether a value is parked in the slot
    pub fn has_pending(&self) -> bool {
        self.lock().slot.is_some()
    }

    /// Close the mailbox, waking any waiter with `None` and dropping the slot
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.slot = None;
        state.waiter = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_send_before_recv_is_queued() {
        let mailbox = InputMailbox::new();
        assert_eq!(mailbox.send("a"), Delivery::Queued { replaced: false });
        assert!(mailbox.has_pending());
        assert_eq!(mailbox.recv().await, Some("a"));
        assert!(!mailbox.has_pending());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let mailbox = InputMailbox::new();
        mailbox.send("first");
        assert_eq!(mailbox.send("second"), Delivery::Queued { replaced: true });

        assert_eq!(mailbox.recv().await, Some("second"));

        // The first payload is gone for good
        let pending = tokio::time::timeout(Duration::from_millis(20), mailbox.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_send_to_waiter_is_delivered() {
        let mailbox = Arc::new(InputMailbox::new());
        let receiver = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.recv().await })
        };

        while !mailbox.has_waiter() {
            tokio::task::yield_now().await;
        }

        assert_eq!(mailbox.send(7), Delivery::Delivered);
        assert_eq!(receiver.await.unwrap(), Some(7));
        assert!(!mailbox.has_waiter());
    }

    #[test]
    fn test_waiter_flag_with_manual_polling() {
        let mailbox = InputMailbox::new();
        let mut recv = tokio_test::task::spawn(mailbox.recv());

        tokio_test::assert_pending!(recv.poll());
        assert!(mailbox.has_waiter());
        assert!(!mailbox.has_pending());

        assert_eq!(mailbox.send("x"), Delivery::Delivered);
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some("x"));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let mailbox = Arc::new(InputMailbox::<String>::new());
        let receiver = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.recv().await })
        };

        while !mailbox.has_waiter() {
            tokio::task::yield_now().await;
        }

        mailbox.close();
        assert_eq!(receiver.await.unwrap(), None);
        assert_eq!(mailbox.send("late".to_string()), Delivery::Closed);
        assert!(mailbox.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_swallow_value() {
        let mailbox = InputMailbox::new();
        {
            let recv = mailbox.recv();
            // Dropped before completion
            let _ = tokio::time::timeout(Duration::from_millis(5), recv).await;
        }

        assert!(!mailbox.has_waiter());
        assert_eq!(mailbox.send(1), Delivery::Queued { replaced: false });
        assert_eq!(mailbox.recv().await, Some(1));
    }
}
