// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative CPU profiling.
//!
//! Every worker thread samples the task it runs at the configured rate. Samples are taken at
//! call boundaries and deliver the call sites of the task's frames, innermost first.

use crate::context::{self, Current};
use crate::sched::Sched;
use crate::worker::Worker;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::Ordering;
use core::time::Duration;
use parking_lot::Mutex;
use segstack::Pc;
use std::sync::Arc;
use std::time::Instant;

/// Receives profiling samples.
pub type ProfileFn = Arc<dyn Fn(&[Pc]) + Send + Sync>;

/// Most frames delivered per sample.
const MAX_SAMPLE_DEPTH: usize = 100;

pub(crate) struct Profiler {
    state: Mutex<ProfState>,
}

struct ProfState {
    func: Option<ProfileFn>,
    hz: u32,
}

#[derive(Clone, Copy)]
struct Sampler {
    enabled: bool,
    interval: Duration,
    next: Option<Instant>,
}

thread_local! {
    static SAMPLER: Cell<Sampler> = const { Cell::new(Sampler::OFF) };
}

// === impl Profiler ===

impl Profiler {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ProfState { func: None, hz: 0 }),
        }
    }

    fn func(&self) -> Option<ProfileFn> {
        self.state.lock().func.clone()
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Profiler")
            .field("hz", &state.hz)
            .field("func", &state.func.is_some())
            .finish()
    }
}

impl Sampler {
    const OFF: Self = Self {
        enabled: false,
        interval: Duration::ZERO,
        next: None,
    };
}

/// Set the global profiling rate. A rate of 0 (or no receiver) turns profiling off.
pub(crate) fn set_cpu_profile_rate(sched: &Sched, hz: i32, func: Option<ProfileFn>) {
    let hz = u32::try_from(hz).unwrap_or(0);
    let (hz, func) = match func {
        Some(func) if hz > 0 => (hz, Some(func)),
        _ => (0, None),
    };

    // Stop sampling on this thread while the receiver is swapped out.
    let cur = context::current().filter(|cx| core::ptr::eq(&*cx.sched, sched));
    if let Some(cx) = &cur {
        reset_cpu_profiler(&cx.worker, 0);
    }

    {
        let mut state = sched.profiler.state.lock();
        state.func = func;
        state.hz = hz;
    }
    {
        // workers compare against this under the scheduler lock when dispatching
        let _g = sched.lock();
        sched.profilehz.store(hz, Ordering::Relaxed);
    }
    tracing::debug!(hz, "cpu profile rate changed");

    if hz != 0
        && let Some(cx) = &cur
    {
        reset_cpu_profiler(&cx.worker, hz);
    }
}

/// Per-thread initialization for a new worker.
pub(crate) fn minit(worker: &Worker) {
    reset_cpu_profiler(worker, 0);
}

/// Switch the calling worker's thread to sampling at `hz`.
#[inline(never)]
pub(crate) fn reset_cpu_profiler(worker: &Worker, hz: u32) {
    worker.profilehz.store(hz, Ordering::Relaxed);
    let sampler = if hz == 0 {
        Sampler::OFF
    } else {
        let interval = Duration::from_secs(1) / hz;
        Sampler {
            enabled: true,
            interval,
            next: Some(Instant::now() + interval),
        }
    };
    SAMPLER.set(sampler);
}

/// Pause or resume sampling on the calling thread, keeping its rate.
#[inline(never)]
pub(crate) fn set_prof(on: bool) {
    let mut sampler = SAMPLER.get();
    sampler.enabled = on && sampler.next.is_some();
    SAMPLER.set(sampler);
}

/// Take a sample of the current task if one is due.
#[inline(never)]
pub(crate) fn sample(cx: &Current) {
    let mut sampler = SAMPLER.get();
    let Some(next) = sampler.next.filter(|_| sampler.enabled) else {
        return;
    };
    let now = Instant::now();
    if now < next {
        return;
    }
    sampler.next = Some(now + sampler.interval);
    SAMPLER.set(sampler);

    let Some(func) = cx.sched.profiler.func() else {
        return;
    };
    let mut pcs = context::inspect_locals(|locals| locals.frame_pcs()).unwrap_or_default();
    pcs.truncate(MAX_SAMPLE_DEPTH);
    func(&pcs);
}
