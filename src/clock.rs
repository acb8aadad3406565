use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::TimerError;
use crate::heap::{DeadlineHeap, Entry};
use crate::timer::Timer;

/// Stand-in for deadlines that overflow `Instant`, roughly 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// State shared by a clock, its dispatcher and every timer it created.
pub(crate) struct Inner {
    /// Instance name for logging
    name: String,

    /// Pending deadlines; the lock orders firing against stop and reset
    heap: Mutex<DeadlineHeap>,

    /// Single-slot "recompute your sleep" signal for the dispatcher
    pub(crate) wake: Arc<Notify>,

    /// Child of the caller's token, cancelled on shutdown or when the last
    /// clock handle and timer are gone
    pub(crate) cancel_token: CancellationToken,
}

impl Inner {
    fn new(name: String, cancel_token: &CancellationToken) -> Self {
        Inner {
            name,
            heap: Mutex::new(DeadlineHeap::new()),
            wake: Arc::new(Notify::new()),
            cancel_token: cancel_token.child_token(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Critical sections never leave the heap half-updated, so a poisoned
    /// lock is still safe to use.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeadlineHeap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `entry` and wake the dispatcher if it is now the earliest.
    pub(crate) fn schedule(&self, heap: &mut DeadlineHeap, when: Instant, entry: Arc<Entry>) {
        if heap.insert(when, entry) {
            self.wake.notify_one();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Owner of a deadline heap and the dispatcher thread that fires it.
///
/// Most code uses the process-wide clock through [`crate::new_timer`] and
/// friends. Separate clocks are useful to isolate heavy timer traffic or to
/// get a dispatcher that can be shut down.
///
/// Cloning a `Clock` yields another handle to the same heap and dispatcher.
/// The dispatcher thread exits once every clone and every timer created by
/// the clock has been dropped.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Inner>,
}

impl Clock {
    /// Create a clock and start its dispatcher on a dedicated thread.
    ///
    /// # Arguments
    /// * `name` - Clock name, used in logs and for the dispatcher thread
    /// * `cancel_token` - Cancelling it stops the dispatcher; timers still
    ///   pending at that point never fire
    pub fn new(name: String, cancel_token: CancellationToken) -> Result<Self, TimerError> {
        let inner = Arc::new(Inner::new(name, &cancel_token));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let dispatcher = Dispatcher::new(&inner);
        thread::Builder::new()
            .name(format!("kairos-{}", inner.name()))
            .spawn(move || runtime.block_on(dispatcher.run()))?;

        log::debug!("Clock '{}' created", inner.name());
        Ok(Clock { inner })
    }

    /// The process-wide clock, started on first use and never shut down.
    pub fn global() -> &'static Clock {
        static GLOBAL: OnceLock<Clock> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Clock::new("global".to_string(), CancellationToken::new())
                .unwrap_or_else(|e| panic!("kairos: cannot start the global clock: {}", e))
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Create a timer that delivers the current time once `delay` has
    /// elapsed. A zero delay fires as soon as possible.
    pub fn new_timer(&self, delay: Duration) -> Timer {
        self.new_timer_at(deadline_after(Instant::now(), delay))
    }

    /// Create a timer that fires at `deadline`. A deadline in the past fires
    /// as soon as possible.
    pub fn new_timer_at(&self, deadline: Instant) -> Timer {
        let (tx, rx) = mpsc::channel(1);
        let entry = Entry::new(tx);
        {
            let mut heap = self.inner.lock();
            self.inner.schedule(&mut heap, deadline, entry.clone());
        }
        Timer::new(self.inner.clone(), entry, rx)
    }

    /// Create a timer that is not scheduled. Arm it with
    /// [`Timer::reset`].
    pub fn new_stopped_timer(&self) -> Timer {
        let (tx, rx) = mpsc::channel(1);
        Timer::new(self.inner.clone(), Entry::new(tx), rx)
    }

    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }

    /// Stop the dispatcher, as cancelling the token passed to
    /// [`Clock::new`] does. The caller's token itself is left untouched.
    ///
    /// Timers of a shut-down clock never fire, so [`Timer::recv`] on them
    /// never returns.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.inner.name())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}
