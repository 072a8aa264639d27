// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::Context;
use crate::note::Note;
use crate::sched::{Descheduled, Dispatch, Sched, Stop};
use crate::{fatal, profile};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use corosensei::CoroutineResult;
use std::io;
use std::sync::Arc;

/// Identifies a worker thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

/// A worker thread that the runtime wants started.
///
/// Passed to the thread-start hook configured with
/// [`Builder::thread_start`](crate::Builder::thread_start). The hook must call [`run`](Self::run)
/// on a new OS thread.
pub struct ThreadStart {
    worker: WorkerId,
    name: String,
    main: Box<dyn FnOnce() + Send>,
}

/// The parts of a worker that are read without the scheduler lock.
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    /// Woken when a task was handed to this worker (or it was recruited to help the collector).
    pub(crate) havenextg: Note,
    /// The profiling rate this worker's thread currently samples at.
    pub(crate) profilehz: AtomicU32,
    /// Set while this worker has the world stopped.
    pub(crate) gcing: AtomicBool,
}

/// The parts of a worker owned by the scheduler.
#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) shared: Arc<Worker>,
    /// Task handed to this worker by somebody else.
    pub(crate) nextg: Option<usize>,
    /// The worker is asleep waiting for `nextg`.
    pub(crate) waitnextg: bool,
    /// The worker is (or should start) helping the collector; also marks a worker that does
    /// not yet hold a running slot it has to give back.
    pub(crate) helpgc: bool,
    /// The task locked to this worker.
    pub(crate) lockedg: Option<usize>,
    /// This worker's idle task, if it was readied.
    pub(crate) idleg: Option<usize>,
    /// The task this worker is running.
    pub(crate) curg: Option<usize>,
}

// === impl WorkerId ===

impl WorkerId {
    /// The worker running on the thread that called [`Runtime::run`](crate::Runtime::run).
    pub const BOOTSTRAP: Self = Self(0);

    pub(crate) const fn new(id: usize) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

// === impl ThreadStart ===

impl ThreadStart {
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Suggested thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the worker. Returns once the runtime exited.
    pub fn run(self) {
        (self.main)();
    }
}

impl fmt::Debug for ThreadStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStart")
            .field("worker", &self.worker)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// === impl Worker ===

impl Worker {
    pub(crate) fn new(id: WorkerId) -> Self {
        Self {
            id,
            havenextg: Note::new(),
            profilehz: AtomicU32::new(0),
            gcing: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_gcing(&self) -> bool {
        self.gcing.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("havenextg", &self.havenextg)
            .field("profilehz", &self.profilehz.load(Ordering::Relaxed))
            .field("gcing", &self.is_gcing())
            .finish()
    }
}

// === impl WorkerState ===

impl WorkerState {
    pub(crate) fn new(shared: Arc<Worker>) -> Self {
        Self {
            shared,
            nextg: None,
            waitnextg: false,
            helpgc: false,
            lockedg: None,
            idleg: None,
            curg: None,
        }
    }
}

/// Start the OS thread for worker `id`.
pub(crate) fn start_thread(sched: Arc<Sched>, id: WorkerId) -> io::Result<()> {
    let name = format!("gsched-worker-{}", id.0);
    match sched.config.thread_start.clone() {
        Some(hook) => {
            hook(ThreadStart {
                worker: id,
                name,
                main: Box::new(move || mstart(sched, id)),
            });
            Ok(())
        }
        None => std::thread::Builder::new()
            .name(name)
            .spawn(move || mstart(sched, id))
            .map(drop),
    }
}

/// The worker loop: ask the scheduler for a task, run it until it stops, hand it back.
pub(crate) fn mstart(sched: Arc<Sched>, id: WorkerId) {
    let worker = sched.worker(id);
    let _span = tracing::debug_span!("worker", id = id.0).entered();
    tracing::debug!("worker started");

    fatal::minit();
    profile::minit(&worker);

    let mut prev = None;
    while let Some(next) = sched.schedule(id, prev.take()) {
        prev = Some(execute(&sched, &worker, next));
    }

    tracing::debug!("worker exiting");
}

fn execute(sched: &Arc<Sched>, worker: &Arc<Worker>, dispatch: Dispatch) -> Descheduled {
    let Dispatch {
        task,
        header,
        mut exec,
    } = dispatch;
    let _span = tracing::trace_span!("task", id = task.as_u64()).entered();

    let result = exec.resume(|locals| Context {
        sched: sched.clone(),
        worker: worker.clone(),
        task,
        header,
        locals,
    });

    let stop = match result {
        CoroutineResult::Yield(reason) => Stop::Suspended(reason),
        CoroutineResult::Return(()) => Stop::Exited,
    };
    tracing::trace!(?stop, "task stopped");

    Descheduled { task, exec, stop }
}
