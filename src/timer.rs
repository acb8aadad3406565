use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc;

use crate::clock::{deadline_after, Inner};
use crate::error::TimerError;
use crate::heap::Entry;

/// A single event that delivers the current time once its deadline passes.
///
/// Timers come from a [`Clock`](crate::Clock) (or the free functions that use
/// the global clock). Each firing buffers exactly one [`Instant`], which can
/// be taken with [`recv`](Timer::recv), [`blocking_recv`](Timer::blocking_recv),
/// [`try_recv`](Timer::try_recv) or by polling the timer as a [`Stream`].
///
/// `Timer::default()` is an uninitialized handle: it never fires, receiving
/// from it yields `None`, and `stop`/`reset` fail with
/// [`TimerError::UninitializedHandle`].
///
/// Dropping a pending timer cancels it.
#[derive(Default)]
pub struct Timer {
    inner: Option<Armed>,
}

struct Armed {
    clock: Arc<Inner>,
    entry: Arc<Entry>,
    rx: mpsc::Receiver<Instant>,
}

impl Timer {
    pub(crate) fn new(clock: Arc<Inner>, entry: Arc<Entry>, rx: mpsc::Receiver<Instant>) -> Self {
        Timer {
            inner: Some(Armed { clock, entry, rx }),
        }
    }

    /// Prevent the timer from firing.
    ///
    /// Returns true if the call stopped a pending timer, false if it had
    /// already fired or been stopped. A value that was already delivered
    /// stays receivable; the channel is never closed.
    pub fn stop(&self) -> Result<bool, TimerError> {
        let armed = self
            .inner
            .as_ref()
            .ok_or(TimerError::UninitializedHandle { op: "Stop" })?;

        let mut heap = armed.clock.lock();
        Ok(heap.remove(&armed.entry).is_some())
    }

    /// Reschedule the timer to fire after `delay`.
    ///
    /// Any value delivered by an earlier firing and not yet received is
    /// discarded, so the next receive observes the new deadline. Returns
    /// true if the timer was pending before the call.
    pub fn reset(&mut self, delay: Duration) -> Result<bool, TimerError> {
        self.rearm(|now| deadline_after(now, delay))
    }

    /// Like [`reset`](Timer::reset), with an absolute deadline. A deadline
    /// in the past fires as soon as possible.
    pub fn reset_at(&mut self, deadline: Instant) -> Result<bool, TimerError> {
        self.rearm(|_| deadline)
    }

    fn rearm(&mut self, deadline: impl FnOnce(Instant) -> Instant) -> Result<bool, TimerError> {
        let armed = self
            .inner
            .as_mut()
            .ok_or(TimerError::UninitializedHandle { op: "Reset" })?;

        let mut heap = armed.clock.lock();
        let was_active = heap.remove(&armed.entry).is_some();
        // The dispatcher only sends under this lock, so nothing can land
        // between the drain and the re-insert.
        let _ = armed.rx.try_recv();
        let when = deadline(Instant::now());
        armed.clock.schedule(&mut heap, when, armed.entry.clone());

        Ok(was_active)
    }

    /// The deadline this timer is waiting for, `None` unless pending.
    pub fn deadline(&self) -> Option<Instant> {
        let armed = self.inner.as_ref()?;
        armed.clock.lock().deadline_of(&armed.entry)
    }

    /// Whether a fired value is buffered and not yet received.
    pub fn is_ready(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|armed| !armed.rx.is_empty())
    }

    /// Wait for the next value. Returns `None` only for an uninitialized
    /// timer; a stopped timer waits until it is reset and fires.
    ///
    /// A timer whose clock was shut down never fires, so this never returns
    /// for it. Check [`Clock::is_shutdown`](crate::Clock::is_shutdown) or
    /// wrap the call in a timeout when the clock may be shut down.
    pub async fn recv(&mut self) -> Option<Instant> {
        match self.inner.as_mut() {
            Some(armed) => armed.rx.recv().await,
            None => None,
        }
    }

    /// Blocking variant of [`recv`](Timer::recv) for synchronous code.
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_recv(&mut self) -> Option<Instant> {
        match self.inner.as_mut() {
            Some(armed) => armed.rx.blocking_recv(),
            None => None,
        }
    }

    /// Take a buffered value without waiting.
    pub fn try_recv(&mut self) -> Option<Instant> {
        self.inner
            .as_mut()
            .and_then(|armed| armed.rx.try_recv().ok())
    }
}

impl Stream for Timer {
    type Item = Instant;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Instant>> {
        match self.inner.as_mut() {
            Some(armed) => armed.rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Only reset can make an idle entry pending again, and that needs
        // `&mut self`, so skipping the lock here cannot miss an insert.
        if let Some(armed) = &self.inner {
            if armed.entry.is_pending() {
                armed.clock.lock().remove(&armed.entry);
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(armed) => f
                .debug_struct("Timer")
                .field("clock", &armed.clock.name())
                .field("pending", &armed.entry.is_pending())
                .field("ready", &!armed.rx.is_empty())
                .finish(),
            None => f.write_str("Timer(uninitialized)"),
        }
    }
}
