//! Time source and timer queue
//!
//! Every timeout in the ball-tracking core (switch settle delays, eject
//! confirmation, missing-ball deadlines, ball search ticks) is a one-shot
//! or periodic entry in a [`TimerQueue`]. The queue never reads a clock on
//! its own: callers pass `now` in, which keeps the whole core deterministic
//! under a [`ManualClock`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Milliseconds on the machine clock
pub type Millis = u64;

// ═══════════════════════════════════════════════════════════════════════════════
// CLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Monotonic millisecond clock
pub trait Clock: Send {
    fn now_ms(&self) -> Millis;
}

/// Clock advanced explicitly by the caller. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Millis>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock starting at `ms`
    pub fn at(ms: Millis) -> Self {
        Self {
            now: Arc::new(Mutex::new(ms)),
        }
    }

    /// Jump to an absolute time. Moving backwards is ignored.
    pub fn set(&self, ms: Millis) {
        let mut now = self.now.lock();
        if ms > *now {
            *now = ms;
        }
    }

    pub fn advance(&self, ms: Millis) {
        *self.now.lock() += ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        *self.now.lock()
    }
}

/// Wall clock measured from construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TIMER QUEUE
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle returned by the scheduling calls, used to cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
struct TimerEntry<T> {
    payload: T,
    period: Option<Millis>,
}

/// Deadline-ordered queue of pending timers.
///
/// Timers with the same deadline fire in the order they were scheduled.
#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(Millis, u64), TimerEntry<T>>,
    deadlines: HashMap<u64, Millis>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 1,
        }
    }
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `payload` once at `now + delay`
    pub fn schedule_once(&mut self, now: Millis, delay: Millis, payload: T) -> TimerHandle {
        self.insert(now.saturating_add(delay), payload, None)
    }

    /// Fire `payload` every `period` ms, first at `now + period`
    pub fn schedule_interval(&mut self, now: Millis, period: Millis, payload: T) -> TimerHandle {
        let period = period.max(1);
        self.insert(now.saturating_add(period), payload, Some(period))
    }

    fn insert(&mut self, deadline: Millis, payload: T, period: Option<Millis>) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries
            .insert((deadline, id), TimerEntry { payload, period });
        self.deadlines.insert(id, deadline);
        TimerHandle(id)
    }

    /// Cancel a pending timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.entries.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Deadline of a pending timer
    pub fn deadline(&self, handle: TimerHandle) -> Option<Millis> {
        self.deadlines.get(&handle.0).copied()
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer due at or before `now`.
    ///
    /// Interval timers are re-armed one period after their previous deadline
    /// and keep their handle.
    pub fn pop_due(&mut self, now: Millis) -> Option<(TimerHandle, T)> {
        let (&(deadline, id), _) = self.entries.iter().next()?;
        if deadline > now {
            return None;
        }
        let entry = self.entries.remove(&(deadline, id))?;
        match entry.period {
            Some(period) => {
                let next = deadline.saturating_add(period);
                self.entries.insert(
                    (next, id),
                    TimerEntry {
                        payload: entry.payload.clone(),
                        period: Some(period),
                    },
                );
                self.deadlines.insert(id, next);
            }
            None => {
                self.deadlines.remove(&id);
            }
        }
        Some((TimerHandle(id), entry.payload))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}
