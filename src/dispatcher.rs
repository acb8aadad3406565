use std::future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::Inner;
use crate::heap::DeadlineHeap;

/// Background worker that fires due timers for one clock.
///
/// It is the only producer of timer notifications. Each pass fires
/// everything that is due, then sleeps until the next deadline, a wake
/// signal from the clock, or cancellation. It only holds the clock weakly
/// while asleep, so the clock going away (which cancels the token) ends it.
pub(crate) struct Dispatcher {
    name: String,
    inner: Weak<Inner>,
    wake: Arc<Notify>,
    cancel_token: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(inner: &Arc<Inner>) -> Self {
        Dispatcher {
            name: inner.name().to_string(),
            inner: Arc::downgrade(inner),
            wake: inner.wake.clone(),
            cancel_token: inner.cancel_token.clone(),
        }
    }

    /// Run the dispatcher until its clock is shut down or dropped.
    pub(crate) async fn run(self) {
        log::info!("Timer dispatcher '{}' started", self.name);

        loop {
            let Some(inner) = self.inner.upgrade() else {
                break;
            };
            let next = self.fire_pass(&inner);
            drop(inner);

            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    if self.inner.strong_count() == 0 {
                        log::info!("Timer dispatcher '{}' shutting down - all handles dropped", self.name);
                    } else {
                        log::info!("Timer dispatcher '{}' cancelled via token", self.name);
                    }
                    break;
                },

                // An earlier deadline was scheduled; recompute.
                _ = self.wake.notified() => {},

                _ = sleep_until(next) => {},
            }
        }

        log::info!("Timer dispatcher '{}' stopped", self.name);
    }

    /// Fire everything due and return the next deadline. Logging happens
    /// after the lock is released.
    fn fire_pass(&self, inner: &Inner) -> Option<Instant> {
        let (counts, next) = {
            let mut heap = inner.lock();
            let counts = fire_due(&mut heap, Instant::now());
            (counts, heap.peek_min())
        };
        counts.log(&self.name);
        next
    }
}

/// Outcome of one firing pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FireCounts {
    pub(crate) fired: usize,
    /// Fired while the previous value was still buffered.
    pub(crate) overflowed: usize,
    /// Fired after the timer handle was dropped.
    pub(crate) orphaned: usize,
    pub(crate) max_lateness: Duration,
}

impl FireCounts {
    fn log(&self, name: &str) {
        if self.fired > 0 {
            log::trace!(
                "Fired {} timer(s) in '{}', at most {:?} after deadline",
                self.fired,
                name,
                self.max_lateness
            );
        }
        if self.orphaned > 0 {
            log::trace!("{} timer(s) in '{}' fired after their handle was dropped", self.orphaned, name);
        }
        // Reset drains the buffer before re-arming, so this means that
        // invariant was broken.
        if self.overflowed > 0 {
            log::warn!(
                "{} timer(s) in '{}' fired with an unconsumed value still buffered, dropping them",
                self.overflowed,
                name
            );
        }
    }
}

/// Pop every entry due at `now` and send `now` into its channel. Runs under
/// the clock lock, so it must not block or log.
pub(crate) fn fire_due(heap: &mut DeadlineHeap, now: Instant) -> FireCounts {
    let mut counts = FireCounts::default();

    while let Some((when, entry)) = heap.pop_due(now) {
        match entry.sender().try_send(now) {
            Ok(()) => {
                counts.fired += 1;
                counts.max_lateness = counts.max_lateness.max(now.duration_since(when));
            }
            Err(TrySendError::Full(_)) => counts.overflowed += 1,
            Err(TrySendError::Closed(_)) => counts.orphaned += 1,
        }
    }
    counts
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Entry;
    use tokio::sync::mpsc;

    #[test]
    fn test_fire_due_counts_each_outcome() {
        let now = Instant::now();
        let mut heap = DeadlineHeap::new();

        let (tx, mut live) = mpsc::channel(1);
        heap.insert(now - Duration::from_millis(5), Entry::new(tx));

        let (tx, mut full) = mpsc::channel(1);
        tx.try_send(now).unwrap();
        heap.insert(now, Entry::new(tx));

        let (tx, dropped) = mpsc::channel(1);
        drop(dropped);
        heap.insert(now, Entry::new(tx));

        let (tx, mut later) = mpsc::channel(1);
        heap.insert(now + Duration::from_secs(1), Entry::new(tx));

        let counts = fire_due(&mut heap, now);
        assert_eq!(
            counts,
            FireCounts {
                fired: 1,
                overflowed: 1,
                orphaned: 1,
                max_lateness: Duration::from_millis(5),
            }
        );

        assert_eq!(live.try_recv().unwrap(), now);
        // The value already buffered is kept, not replaced.
        assert!(full.try_recv().is_ok());
        assert!(full.try_recv().is_err());
        assert!(later.try_recv().is_err());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_fire_due_on_empty_heap() {
        let mut heap = DeadlineHeap::new();
        assert_eq!(fire_due(&mut heap, Instant::now()), FireCounts::default());
    }
}
