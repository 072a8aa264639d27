// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context;
use crate::sched::Sched;
use crate::task::{Suspend, TaskId};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A counting semaphore for tasks. Waiting tasks park instead of blocking their worker.
pub struct Semaphore {
    permits: AtomicU32,
    waiters: Mutex<VecDeque<(TaskId, Arc<Sched>)>>,
}

impl Semaphore {
    #[must_use]
    pub const fn new(permits: u32) -> Self {
        Self {
            permits: AtomicU32::new(permits),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Take a permit, parking the current task until one is available.
    pub fn acquire(&self) {
        if self.try_acquire() {
            return;
        }
        let cx = context::expect_current("Semaphore::acquire");
        let me = (cx.task, cx.sched.clone());
        drop(cx);

        loop {
            {
                let mut waiters = self.waiters.lock();
                if self.try_acquire() {
                    return;
                }
                waiters.push_back(me.clone());
            }
            // A release between the push and here readies us as soon as we stopped running.
            context::suspend(Suspend::Park("semacquire"));
            if self.try_acquire() {
                return;
            }
        }
    }

    /// Return a permit, waking the longest waiting task.
    pub fn release(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
        let waiter = self.waiters.lock().pop_front();
        if let Some((task, sched)) = waiter {
            sched.ready(task);
        }
    }

    /// Permits currently available.
    pub fn available(&self) -> u32 {
        self.permits.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available())
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}
