//! Timer registry driven by the Nub's dispatch loop.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tokio::time::Instant;

/// Handle of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    expiry: Instant,
    arg: u64,
}

/// One-shot timers ordered by expiry.
///
/// Timers expiring at the same instant fire in registration order.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    next_id: u64,
    by_expiry: BTreeSet<(Instant, TimerId)>,
    entries: HashMap<TimerId, TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, expiry: Instant, arg: u64) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.insert(id, expiry, arg);
        id
    }

    /// Re-inserts a timer that fired, keeping its id.
    pub fn rearm(&mut self, id: TimerId, expiry: Instant, arg: u64) {
        self.insert(id, expiry, arg);
    }

    fn insert(&mut self, id: TimerId, expiry: Instant, arg: u64) {
        self.by_expiry.insert((expiry, id));
        self.entries.insert(id, TimerEntry { expiry, arg });
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.by_expiry.remove(&(entry.expiry, id));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.by_expiry.first().map(|(expiry, _)| *expiry)
    }

    /// Removes and returns the earliest timer due at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, u64)> {
        let (expiry, id) = *self.by_expiry.first()?;
        if expiry > now {
            return None;
        }
        self.by_expiry.remove(&(expiry, id));
        let entry = self.entries.remove(&id)?;
        Some((id, entry.arg))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
