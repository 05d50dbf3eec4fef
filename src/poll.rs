use std::{
    thread,
    time::{Duration, Instant},
};

use log::trace;

/// Source of time for code that waits on the outside world.
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Evaluates `predicate` every `interval` until it returns true or `timeout`
/// has elapsed. Returns whether the predicate was ever satisfied.
///
/// Sleeps never overshoot the timeout, so a predicate that never holds is
/// given up on after exactly `timeout`.
pub fn wait_until(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    mut predicate: impl FnMut() -> bool,
) -> bool {
    let start = clock.now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        if predicate() {
            trace!("Condition met after {attempt} attempt(s)");
            return true;
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed >= timeout {
            trace!("Condition not met after {attempt} attempt(s), giving up");
            return false;
        }

        clock.sleep(interval.min(timeout - elapsed));
    }
}
