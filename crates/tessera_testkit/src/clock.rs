//! Manual time for deadline-driven tests.

use std::time::{Duration, Instant};
use tessera_reactor::Reactor;

/// A clock that only moves when told to.
///
/// The reactor reads real time when it schedules deadlines, so the clock
/// starts at the real "now" and only ever runs ahead of it.
#[derive(Debug, Clone, Copy)]
pub struct ManualClock {
    now: Instant,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Creates a clock at the current instant.
    pub fn new() -> Self {
        Self { now: Instant::now() }
    }

    /// Returns the clock's current instant.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Moves the clock forward and returns the new instant.
    pub fn advance(&mut self, by: Duration) -> Instant {
        self.now += by;
        self.now
    }

    /// Moves the clock forward and fires every reactor deadline that passed.
    pub fn tick(&mut self, reactor: &Reactor, by: Duration) {
        let now = self.advance(by);
        reactor.poll_timers(now);
    }

    /// Jumps to the reactor's next deadline, if it has one, and fires it.
    /// Returns false if nothing was scheduled.
    pub fn fire_next(&mut self, reactor: &Reactor) -> bool {
        let Some(deadline) = reactor.next_deadline() else {
            return false;
        };
        if deadline > self.now {
            self.now = deadline;
        }
        reactor.poll_timers(self.now);
        true
    }
}
