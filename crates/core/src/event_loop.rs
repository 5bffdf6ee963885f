// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::tree::NodeId;
use crate::update::UpdateId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// Virtual time in milliseconds since the loop was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, earlier: SimTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        let ms = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        SimTime(self.0.saturating_add(ms))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Work a timer performs when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Materialize a tree node.
    Attach(NodeId),
    /// Bring back the target of an update.
    Reattach(UpdateId),
}

/// One-shot timers over a virtual clock.
///
/// Timers are ordered by deadline, then by the order they were armed. The
/// clock only moves forward when a timer is popped or the caller advances it.
#[derive(Debug, Default)]
pub struct EventLoop {
    now: SimTime,
    next_id: u64,
    timers: BTreeMap<(SimTime, TimerId), Task>,
    deadlines: HashMap<TimerId, SimTime>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn add_timeout(&mut self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let due = self.now + delay;
        self.timers.insert((due, id), task);
        self.deadlines.insert(id, due);
        tracing::trace!("timer {:?} armed for {} ({:?})", id, due, task);
        id
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(due) => self.timers.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Whether a timer for `task` is still waiting to fire.
    pub fn is_scheduled(&self, task: Task) -> bool {
        self.timers.values().any(|t| *t == task)
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn next_due(&self) -> Option<SimTime> {
        self.timers.keys().next().map(|(due, _)| *due)
    }

    /// Pop the earliest timer due at or before `limit`, advancing the clock to
    /// its deadline.
    pub fn pop_due(&mut self, limit: SimTime) -> Option<(TimerId, Task)> {
        let (due, id) = *self.timers.keys().next()?;
        if due > limit {
            return None;
        }
        let task = self.timers.remove(&(due, id))?;
        self.deadlines.remove(&id);
        if due > self.now {
            self.now = due;
        }
        Some((id, task))
    }

    /// Move the clock forward; never backwards.
    pub fn advance_to(&mut self, at: SimTime) {
        if at > self.now {
            self.now = at;
        }
    }
}
