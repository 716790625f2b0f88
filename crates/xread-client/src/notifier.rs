//! Countdown notifier.
//!
//! A batch of N requests shares one `Countdown` initialised to N; a single
//! submit gets its own countdown of 1. Every completion decrements it and
//! wakes all waiters, which lets a waiter on one member of a batch recheck
//! its own request as well as the whole batch.
//!
//! The countdown remembers the first failure *signalled*, which is the
//! first failure the I/O thread delivered, not necessarily the first in
//! submission order.

use xread_core::error::{Result, XreadError};

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    remaining: usize,
    first_error: Option<i32>,
}

#[derive(Debug)]
pub struct Countdown {
    total: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl Countdown {
    pub fn new(n: usize) -> Self {
        Self {
            total: n,
            state: Mutex::new(State {
                remaining: n,
                first_error: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().remaining
    }

    /// Record one completion; `errno == 0` is success.
    pub fn signal(&self, errno: i32) {
        let mut state = self.state.lock();
        debug_assert!(state.remaining > 0, "countdown signalled past zero");
        state.remaining = state.remaining.saturating_sub(1);
        if errno != 0 && state.first_error.is_none() {
            state.first_error = Some(errno);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Block until every member completed. Returns the first failure
    /// observed, or `TimedOut` with nothing changed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.remaining > 0 {
            match deadline {
                None => self.cond.wait(&mut state),
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out() && state.remaining > 0 {
                        return Err(XreadError::TimedOut);
                    }
                }
            }
        }
        match state.first_error {
            Some(errno) => Err(XreadError::from_errno(errno)),
            None => Ok(()),
        }
    }

    /// Block until `done()` holds. `done` is evaluated under the lock, so a
    /// completion published before its `signal` is never missed.
    pub(crate) fn wait_for(&self, done: impl Fn() -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !done() {
            match deadline {
                None => self.cond.wait(&mut state),
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out() {
                        return done();
                    }
                }
            }
        }
        true
    }
}
