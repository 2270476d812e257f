//! Time-ordered scheduling of waits, one-shot callbacks and repeating callbacks.
//!
//! The [`TimerScheduler`] keeps every armed timer in a time index keyed by absolute deadline. Nothing fires on its
//! own: the owner calls [`TimerScheduler::update`] once per tick (or runs [`TimerScheduler::spawn_driver`]), and
//! each call fires everything whose deadline has passed. When nothing is due, `update` returns after a single
//! comparison against the cached earliest deadline.
//!
//! Times are milliseconds as read from the scheduler's [`Clock`].
//!
//! # Example
//!
//! ```
//! use std::sync::{
//!     atomic::{AtomicU32, Ordering},
//!     Arc,
//! };
//!
//! use shardline::timer::{ManualClock, TimerScheduler};
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let scheduler = TimerScheduler::new(clock.clone());
//!
//! let fired = Arc::new(AtomicU32::new(0));
//! let id = scheduler.once(50, {
//!     let fired = fired.clone();
//!     move || {
//!         fired.fetch_add(1, Ordering::Relaxed);
//!     }
//! });
//! assert_ne!(id, 0);
//!
//! clock.advance(49);
//! scheduler.update();
//! assert_eq!(fired.load(Ordering::Relaxed), 0);
//!
//! clock.advance(1);
//! scheduler.update();
//! assert_eq!(fired.load(Ordering::Relaxed), 1);
//! ```

mod clock;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::event::EventPublisher;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};

/// Configuration for a [`TimerScheduler`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often [`TimerScheduler::spawn_driver`] calls `update`, in milliseconds.
    pub tick_interval_ms: u64,
    /// Smallest period accepted by [`TimerScheduler::repeating`], in milliseconds.
    pub min_repeat_interval_ms: i64,
    /// Length of one frame for [`TimerScheduler::wait_frame`] and [`TimerScheduler::frame_timer`], in milliseconds.
    pub frame_interval_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval_ms: 1,
            min_repeat_interval_ms: 100,
            frame_interval_ms: 100,
        }
    }
}

/// The kind of an armed timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Resolves a suspended wait.
    OnceWait,
    /// Invokes a callback once.
    OnceCallback,
    /// Invokes a callback every period until cancelled.
    Repeating,
}

enum TimerAction {
    OnceWait(oneshot::Sender<()>),
    OnceCallback(Box<dyn FnOnce() + Send + 'static>),
    Repeating(Arc<dyn Fn() + Send + Sync + 'static>),
}

impl TimerAction {
    fn kind(&self) -> TimerKind {
        match self {
            TimerAction::OnceWait(_) => TimerKind::OnceWait,
            TimerAction::OnceCallback(_) => TimerKind::OnceCallback,
            TimerAction::Repeating(_) => TimerKind::Repeating,
        }
    }
}

struct TimerEntry {
    armed_at: i64,
    period: i64,
    action: TimerAction,
}

struct TimerState {
    next_id: u64,
    /// Earliest deadline in `time_index`, or `i64::MAX` when empty.
    min_time: i64,
    /// Deadline to the ids due at that deadline, in registration order.
    ///
    /// Cancelled ids are left behind here and skipped when their bucket fires.
    time_index: BTreeMap<i64, Vec<u64>>,
    entries: HashMap<u64, TimerEntry>,
}

impl TimerState {
    fn insert(&mut self, id: u64, entry: TimerEntry) {
        let deadline = entry.armed_at.saturating_add(entry.period);
        self.time_index.entry(deadline).or_default().push(id);
        self.entries.insert(id, entry);
        if deadline < self.min_time {
            self.min_time = deadline;
        }
    }
}

enum Fire {
    Wait(oneshot::Sender<()>),
    Once(Box<dyn FnOnce() + Send + 'static>),
    Repeating(Arc<dyn Fn() + Send + Sync + 'static>),
}

/// Schedules waits and callbacks against a millisecond clock.
///
/// Timer ids are never `0`, so `0` can be used by callers as "no timer".
pub struct TimerScheduler {
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    state: Mutex<TimerState>,
}

impl TimerScheduler {
    /// Creates a scheduler reading time from `clock`, with the default configuration.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    /// Creates a scheduler reading time from `clock`.
    pub fn with_config(clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        TimerScheduler {
            clock,
            config,
            state: Mutex::new(TimerState {
                next_id: 0,
                min_time: i64::MAX,
                time_index: BTreeMap::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Returns the scheduler's configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the current time according to the scheduler's clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Fires every timer whose deadline has passed.
    ///
    /// Timers fire in deadline order, and timers sharing a deadline fire in the order they were registered.
    /// Callbacks run on the calling thread without any scheduler lock held, so they may freely schedule or cancel
    /// timers. A repeating timer is re-armed before its callback runs. A panicking callback is logged and does not
    /// prevent later timers from firing.
    pub fn update(&self) {
        let now = self.clock.now();
        let due = {
            let mut state = self.state.lock();
            if state.time_index.is_empty() || now < state.min_time {
                return;
            }

            let mut due = Vec::new();
            while let Some(bucket) = state.time_index.first_entry() {
                if *bucket.key() > now {
                    break;
                }
                due.extend(bucket.remove());
            }
            state.min_time = state
                .time_index
                .keys()
                .next()
                .copied()
                .unwrap_or(i64::MAX);
            due
        };

        for id in due {
            let Some(fire) = self.take_due(id) else {
                continue;
            };

            match fire {
                Fire::Wait(tx) => {
                    let _ = tx.send(());
                }
                Fire::Once(callback) => {
                    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        error!(timer_id = id, "timer callback panicked");
                    }
                }
                Fire::Repeating(callback) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                        error!(timer_id = id, "repeating timer callback panicked");
                    }
                }
            }
        }
    }

    /// Removes a due entry, re-arming it first if it repeats.
    fn take_due(&self, id: u64) -> Option<Fire> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(&id)?;
        let fire = match entry.action {
            TimerAction::OnceWait(tx) => Fire::Wait(tx),
            TimerAction::OnceCallback(callback) => Fire::Once(callback),
            TimerAction::Repeating(callback) => {
                let armed_at = self.clock.now();
                state.insert(
                    id,
                    TimerEntry {
                        armed_at,
                        period: entry.period,
                        action: TimerAction::Repeating(Arc::clone(&callback)),
                    },
                );
                Fire::Repeating(callback)
            }
        };
        Some(fire)
    }

    fn add_timer(&self, armed_at: i64, period: i64, action: TimerAction) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        trace!(timer_id = id, kind = ?action.kind(), armed_at, period, "timer armed");
        state.insert(
            id,
            TimerEntry {
                armed_at,
                period,
                action,
            },
        );
        id
    }

    /// Waits for `time` milliseconds.
    ///
    /// Returns `true` once the time has elapsed, or `false` if `cancel` fired first or the scheduler was cleared.
    /// A zero or negative `time` returns `true` immediately without arming a timer.
    pub async fn wait_for(&self, time: i64, cancel: Option<&CancellationToken>) -> bool {
        if time <= 0 {
            return true;
        }

        let now = self.clock.now();
        self.wait_inner(now, time, cancel).await
    }

    /// Waits until the clock reads `till_time`.
    ///
    /// Behaves like [`wait_for`](TimerScheduler::wait_for), returning `true` immediately if the deadline has
    /// already passed.
    pub async fn wait_until(&self, till_time: i64, cancel: Option<&CancellationToken>) -> bool {
        let now = self.clock.now();
        if now >= till_time {
            return true;
        }

        self.wait_inner(now, till_time - now, cancel).await
    }

    /// Waits for one frame.
    pub async fn wait_frame(&self, cancel: Option<&CancellationToken>) -> bool {
        self.wait_for(self.config.frame_interval_ms, cancel).await
    }

    async fn wait_inner(&self, now: i64, time: i64, cancel: Option<&CancellationToken>) -> bool {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        let id = self.add_timer(now, time, TimerAction::OnceWait(tx));
        // Removes the entry if the wait ends early, including when this future is dropped.
        let _guard = CancelOnDrop {
            scheduler: self,
            id,
        };

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    res = rx => res.is_ok(),
                    _ = token.cancelled() => {
                        trace!(timer_id = id, "wait cancelled");
                        false
                    }
                }
            }
            None => rx.await.is_ok(),
        }
    }

    /// Invokes `callback` once after `time` milliseconds, returning the timer id.
    pub fn once<F>(&self, time: i64, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.clock.now();
        self.add_timer(now, time, TimerAction::OnceCallback(Box::new(callback)))
    }

    /// Invokes `callback` once when the clock reads `till_time`, returning the timer id.
    ///
    /// A deadline that has already passed is logged and fires on the next update.
    pub fn once_at<F>(&self, till_time: i64, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.clock.now();
        if till_time < now {
            error!(till_time, now, "once timer deadline is in the past");
        }

        self.add_timer(
            now,
            till_time - now,
            TimerAction::OnceCallback(Box::new(callback)),
        )
    }

    /// Invokes `callback` every `time` milliseconds until cancelled, returning the timer id.
    ///
    /// The next period is armed, measured from the moment of firing, before `callback` runs. A callback which
    /// cancels its own id therefore removes the already re-armed entry and the timer does not fire again.
    ///
    /// Periods shorter than [`SchedulerConfig::min_repeat_interval_ms`] are rejected: an error is logged and `0` is
    /// returned.
    pub fn repeating<F>(&self, time: i64, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        if time < self.config.min_repeat_interval_ms {
            error!(
                time,
                min = self.config.min_repeat_interval_ms,
                "repeating timer period too small"
            );
            return 0;
        }

        self.repeating_inner(time, Arc::new(callback))
    }

    /// Invokes `callback` once per frame until cancelled, returning the timer id.
    pub fn frame_timer<F>(&self, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.repeating_inner(self.config.frame_interval_ms, Arc::new(callback))
    }

    fn repeating_inner(&self, time: i64, callback: Arc<dyn Fn() + Send + Sync + 'static>) -> u64 {
        let now = self.clock.now();
        self.add_timer(now, time, TimerAction::Repeating(callback))
    }

    /// Publishes `event` once after `time` milliseconds, returning the timer id.
    pub fn once_event<E, P>(&self, time: i64, event: E, publisher: Arc<P>) -> u64
    where
        E: Send + 'static,
        P: EventPublisher<E> + ?Sized,
    {
        self.once(time, move || publisher.publish(event))
    }

    /// Publishes `event` once when the clock reads `till_time`, returning the timer id.
    pub fn once_at_event<E, P>(&self, till_time: i64, event: E, publisher: Arc<P>) -> u64
    where
        E: Send + 'static,
        P: EventPublisher<E> + ?Sized,
    {
        self.once_at(till_time, move || publisher.publish(event))
    }

    /// Publishes a clone of `event` every `time` milliseconds until cancelled, returning the timer id.
    pub fn repeating_event<E, P>(&self, time: i64, event: E, publisher: Arc<P>) -> u64
    where
        E: Clone + Send + Sync + 'static,
        P: EventPublisher<E> + ?Sized,
    {
        self.repeating(time, move || publisher.publish(event.clone()))
    }

    /// Cancels a timer.
    ///
    /// Returns `true` if the timer was still armed. Cancelling `0`, an unknown id, or a timer that already fired
    /// returns `false`.
    pub fn cancel(&self, id: u64) -> bool {
        if id == 0 {
            return false;
        }

        // The entry is dropped after the lock is released, since its callback may own things that cancel timers
        // when dropped.
        let removed = self.state.lock().entries.remove(&id);
        removed.is_some()
    }

    /// Cancels the timer in `id` and resets `id` to `0`.
    pub fn cancel_and_reset(&self, id: &mut u64) -> bool {
        let timer_id = std::mem::take(id);
        self.cancel(timer_id)
    }

    /// Returns `true` if `id` is armed.
    pub fn is_scheduled(&self, id: u64) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Returns the kind of the armed timer `id`.
    pub fn kind(&self, id: u64) -> Option<TimerKind> {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.action.kind())
    }

    /// Returns the number of armed timers.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if no timers are armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every timer. Pending waits resolve as cancelled.
    pub fn clear(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.time_index.clear();
            state.min_time = i64::MAX;
            std::mem::take(&mut state.entries)
        };
        debug!(timers = entries.len(), "timer scheduler cleared");
        drop(entries);
    }

    /// Spawns a task calling [`update`](TimerScheduler::update) every
    /// [`tick_interval_ms`](SchedulerConfig::tick_interval_ms) until `shutdown` is cancelled.
    pub fn spawn_driver(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => scheduler.update(),
                }
            }

            debug!("timer driver stopped");
        })
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TimerScheduler")
            .field("timers", &state.entries.len())
            .field("min_time", &state.min_time)
            .field("config", &self.config)
            .finish()
    }
}

struct CancelOnDrop<'a> {
    scheduler: &'a TimerScheduler,
    id: u64,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.scheduler.cancel(self.id);
    }
}
