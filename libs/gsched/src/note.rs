// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::fatal;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

const STATE_EMPTY: usize = 0;
const STATE_PARKED: usize = 1;
const STATE_NOTIFIED: usize = 2;

/// A one-shot wakeup event for exactly one sleeper and one waker.
///
/// Unlike a parker, a note stays notified once woken: any number of `sleep` calls return
/// immediately until the note is cleared again. Waking a note twice without clearing it in
/// between is a scheduler bug.
pub(crate) struct Note {
    state: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
}

// === impl Note ===

impl Note {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(STATE_EMPTY),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    pub(crate) fn clear(&self) {
        self.state.store(STATE_EMPTY, Ordering::Release);
    }

    pub(crate) fn wakeup(&self) {
        match self.state.swap(STATE_NOTIFIED, Ordering::AcqRel) {
            STATE_EMPTY => {}
            STATE_PARKED => {
                // Take the lock so the sleeper is either not yet waiting on the condvar (and
                // will observe the new state) or already waiting (and will get the signal).
                drop(self.lock.lock());
                self.cvar.notify_one();
            }
            _ => fatal::throw("notewakeup - double wakeup"),
        }
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_NOTIFIED
    }

    pub(crate) fn sleep(&self) {
        self.sleep_inner(None);
    }

    /// Sleep until woken or until `deadline` passes. Returns whether the note was woken.
    pub(crate) fn sleep_until(&self, deadline: Instant) -> bool {
        self.sleep_inner(Some(deadline))
    }

    fn sleep_inner(&self, deadline: Option<Instant>) -> bool {
        if self.is_woken() {
            return true;
        }

        let mut guard = self.lock.lock();
        match self.state.compare_exchange(
            STATE_EMPTY,
            STATE_PARKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_NOTIFIED) => return true,
            Err(_) => fatal::throw("notesleep - waitm out of sync"),
        }

        loop {
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut guard, deadline).timed_out() {
                        return self
                            .state
                            .compare_exchange(
                                STATE_PARKED,
                                STATE_EMPTY,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err();
                    }
                }
                None => self.cvar.wait(&mut guard),
            }

            if self.is_woken() {
                return true;
            }
            // spurious wakeup
        }
    }

    fn describe_state(&self) -> &'static str {
        match self.state.load(Ordering::Relaxed) {
            STATE_EMPTY => "<empty>",
            STATE_PARKED => "<parked>",
            STATE_NOTIFIED => "<notified>",
            _ => "<unknown>",
        }
    }
}

impl fmt::Debug for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Note")
            .field("state", &self.describe_state())
            .finish_non_exhaustive()
    }
}
