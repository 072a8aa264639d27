// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The public runtime handle and the task-facing free functions.
//!
//! The free functions act on the runtime of the calling task and treat being called from outside
//! of a task as a fatal error, except where noted.

use crate::config::{Builder, Config};
use crate::context::{self, Current};
use crate::frame::Frame;
use crate::profile::{self, ProfileFn};
use crate::sched::Sched;
use crate::task::{GcStackBounds, Suspend, TaskId, TaskStatus};
use crate::worker::{self, WorkerId};
use crate::Error;
use core::fmt;
use core::sync::atomic::Ordering;
use core::time::Duration;
use segstack::Pc;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Instant;

/// A scheduler instance.
///
/// Tasks can be spawned before the runtime is started. [`run`](Self::run) and
/// [`run_main`](Self::run_main) turn the calling thread into the bootstrap worker and return
/// once the runtime exited.
pub struct Runtime {
    sched: Arc<Sched>,
}

/// A snapshot of the scheduler's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Tasks that have not finished.
    pub tasks: usize,
    /// Finished task control blocks kept for reuse.
    pub free: usize,
    /// Tasks on the global run queue.
    pub runnable: usize,
    /// Tasks running, handed to a worker, or in a blocking call.
    pub running: usize,
    /// Workers created so far.
    pub workers: usize,
    pub idle_workers: usize,
    /// The configured concurrency limit.
    pub max_workers: usize,
    /// Workers currently executing task code.
    pub mcpu: usize,
    /// The effective concurrency limit; 1 while the world is stopped.
    pub mcpu_max: usize,
}

/// Unwind payload of [`exit`].
pub(crate) struct Exit;

// === impl Runtime ===

impl Runtime {
    /// A runtime configured from the environment.
    #[must_use]
    pub fn new() -> Self {
        Builder::new().build()
    }

    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_config(config: Config) -> Self {
        tracing::debug!(?config, "new runtime");
        Self {
            sched: Sched::new(config),
        }
    }

    /// Spawn a task running `f`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exited`] if the runtime already exited.
    #[track_caller]
    pub fn spawn(&self, f: impl FnOnce(&mut Frame) + Send + 'static) -> Result<TaskId, Error> {
        self.spawn_inner(Box::new(f), &[], Pc::caller())
    }

    /// Spawn a task running `f` with `args` copied into its entry frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exited`] if the runtime already exited.
    #[track_caller]
    pub fn spawn_raw(&self, f: fn(&mut Frame), args: &[u8]) -> Result<TaskId, Error> {
        self.spawn_inner(Box::new(f), args, Pc::caller())
    }

    fn spawn_inner(
        &self,
        entry: Box<dyn FnOnce(&mut Frame) + Send>,
        args: &[u8],
        gopc: Pc,
    ) -> Result<TaskId, Error> {
        self.sched.spawn(entry, args, gopc)
    }

    /// Make a parked task runnable. Can be called from any thread.
    pub fn ready(&self, task: TaskId) {
        self.sched.ready(task);
    }

    /// Run until every task finished or one of them called [`exit`]. Returns the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the runtime was started before.
    pub fn run(&self) -> Result<i32, Error> {
        if !self.sched.mark_started() {
            return Err(Error::AlreadyStarted);
        }
        if !self.sched.start() {
            return Ok(0);
        }
        Ok(self.bootstrap())
    }

    /// Run `main` as the main task: the runtime exits with code 0 as soon as it returns, no
    /// matter what other tasks are still doing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the runtime was started before.
    pub fn run_main(&self, main: impl FnOnce(&mut Frame) + Send + 'static) -> Result<i32, Error> {
        self.run_main_with_init(|_| {}, main)
    }

    /// Like [`run_main`](Self::run_main), running `init` first. While `init` runs the main task
    /// is wired to the bootstrap worker; calling [`lock_os_thread`] from `init` keeps it that
    /// way for `main`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the runtime was started before.
    pub fn run_main_with_init(
        &self,
        init: impl FnOnce(&mut Frame) + Send + 'static,
        main: impl FnOnce(&mut Frame) + Send + 'static,
    ) -> Result<i32, Error> {
        if !self.sched.mark_started() {
            return Err(Error::AlreadyStarted);
        }
        let maintenance = self.sched.config.maintenance;
        // Queued behind anything spawned earlier, picked up by the bootstrap worker since the
        // concurrency limit is 1 until the main task raises it.
        let spawned = self.sched.spawn(
            Box::new(move |frame: &mut Frame| main_task(frame, maintenance, init, main)),
            &[],
            Pc::caller(),
        );
        if spawned.is_err() {
            // exited before it was started
            return Ok(self.sched.exit_code().unwrap_or(0));
        }
        Ok(self.bootstrap())
    }

    fn bootstrap(&self) -> i32 {
        let _span = tracing::info_span!("runtime").entered();
        worker::mstart(self.sched.clone(), WorkerId::BOOTSTRAP);
        let code = self.sched.exit_code().unwrap_or(0);
        tracing::info!(code, "runtime exited");
        code
    }

    /// Shut the runtime down with `code`. Tasks are not unwound; workers stop the next time
    /// they enter the scheduler.
    pub fn exit(&self, code: i32) {
        self.sched.exit(code);
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.sched.stats()
    }

    /// Change the concurrency limit, see [`set_max_workers`].
    pub fn set_max_workers(&self, n: usize) -> usize {
        self.sched.set_max_workers(n)
    }

    #[must_use]
    pub fn num_goroutine(&self) -> usize {
        self.sched.stats().tasks
    }

    #[must_use]
    pub fn mcount(&self) -> usize {
        self.sched.stats().workers
    }

    /// The status of `task`, or `None` once its control block was reused.
    #[must_use]
    pub fn status(&self, task: TaskId) -> Option<TaskStatus> {
        self.sched.status(task)
    }

    /// The stack bounds `task` recorded when it entered its current blocking call.
    #[must_use]
    pub fn gc_stack_bounds(&self, task: TaskId) -> Option<GcStackBounds> {
        self.sched.gc_stack(task)
    }

    /// See [`set_cpu_profile_rate`].
    pub fn set_cpu_profile_rate(&self, hz: i32, func: Option<ProfileFn>) {
        profile::set_cpu_profile_rate(&self.sched, hz, func);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("sched", &self.sched)
            .finish()
    }
}

fn main_task(
    frame: &mut Frame,
    maintenance: Option<Duration>,
    init: impl FnOnce(&mut Frame),
    main: impl FnOnce(&mut Frame),
) {
    lock_os_thread();
    let sched = current("run_main").sched;
    // From now on new tasks may run on other workers.
    sched.begin_init();

    if let Some(period) = maintenance {
        let task = spawn(move |_| maintenance_task(period));
        sched.set_scavenger(task);
    }

    init(frame);
    if !sched.end_init() {
        unlock_os_thread();
    }

    // Give the maintenance task a chance to start, deadlock detection counts on it.
    yield_now();
    main(frame);
    exit(0);
}

/// Periodically calls the collector's scavenger, sleeping in a blocking call in between.
fn maintenance_task(period: Duration) {
    let sched = current("maintenance").sched;
    tracing::debug!(?period, "maintenance task started");
    loop {
        enter_blocking();
        sched.maintenance.sleep_until(Instant::now() + period);
        exit_blocking();

        if sched.is_exiting() {
            break;
        }
        if let Some(collector) = &sched.config.collector {
            collector.scavenge();
        }
    }
}

fn current(op: &str) -> Current {
    context::expect_current(op)
}

/// Spawn a task on the current task's runtime.
///
/// Once the runtime exited, the calling task is terminated instead, the same way [`exit`]
/// terminates it.
#[track_caller]
pub fn spawn(f: impl FnOnce(&mut Frame) + Send + 'static) -> TaskId {
    let gopc = Pc::caller();
    spawned(current("spawn").sched.spawn(Box::new(f), &[], gopc))
}

/// Spawn a task running `f` with `args` copied into its entry frame.
///
/// The rounded argument size must leave room on a minimal stack segment; otherwise this is a
/// fatal error.
#[track_caller]
pub fn spawn_raw(f: fn(&mut Frame), args: &[u8]) -> TaskId {
    let gopc = Pc::caller();
    spawned(current("spawn").sched.spawn(Box::new(f), args, gopc))
}

fn spawned(res: Result<TaskId, Error>) -> TaskId {
    res.unwrap_or_else(|_| {
        tracing::trace!("spawn after exit, terminating task");
        resume_unwind(Box::new(Exit))
    })
}

/// Let other tasks run.
pub fn yield_now() {
    current("yield_now");
    context::suspend(Suspend::Yield);
}

/// Park the current task until somebody calls [`ready`] on it. `reason` shows up in
/// tracebacks.
pub fn park(reason: &'static str) {
    current("park");
    context::suspend(Suspend::Park(reason));
}

/// Make a parked task of the current runtime runnable.
pub fn ready(task: TaskId) {
    current("ready").sched.ready(task);
}

/// The current task, or `None` outside of a task.
#[must_use]
pub fn current_task() -> Option<TaskId> {
    context::current().map(|cx| cx.task)
}

/// The worker running the current task, or `None` outside of a task.
#[must_use]
pub fn worker_id() -> Option<WorkerId> {
    context::current().map(|cx| cx.worker_id())
}

/// Shut the runtime down with `code` and terminate the current task without running its
/// deferred calls.
pub fn exit(code: i32) -> ! {
    current("exit").sched.exit(code);
    resume_unwind(Box::new(Exit))
}

/// The current task is about to block its thread. Frees up a running slot for somebody else.
pub fn enter_blocking() {
    let cx = current("enter_blocking");
    cx.sched.enter_blocking(&cx);
}

/// The current task returned from a blocking call. Waits for a running slot if none is free.
pub fn exit_blocking() {
    let cx = current("exit_blocking");
    if cx.sched.exit_blocking(&cx) {
        return;
    }
    let (sched, header) = (cx.sched, cx.header);

    context::suspend(Suspend::ExitBlocking);
    // rescheduled, so we hold a running slot again
    header.clear_gc_stack();
    if sched.profilehz.load(Ordering::Relaxed) > 0 {
        profile::set_prof(true);
    }
}

/// Run `f` as a blocking call.
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    enter_blocking();
    let res = catch_unwind(AssertUnwindSafe(f));
    exit_blocking();
    res.unwrap_or_else(|payload| resume_unwind(payload))
}

/// Stop every other worker from running task code.
pub fn stop_the_world() {
    let cx = current("stop_the_world");
    cx.sched.stop_the_world(&cx);
}

/// Let the other workers run again. `extra` starts one more worker, for when
/// [`help_gc`] could not recruit as many helpers as it wanted.
pub fn start_the_world(extra: bool) {
    let cx = current("start_the_world");
    cx.sched.start_the_world(&cx, extra);
}

/// Wake idle workers to run [`Collector::gchelper`](crate::Collector::gchelper) while the
/// world is stopped. Returns the number woken and whether that was fewer than wanted.
pub fn help_gc() -> (usize, bool) {
    current("help_gc").sched.help_gc()
}

/// Change the concurrency limit. `0` only queries it. Returns the previous limit.
pub fn set_max_workers(n: usize) -> usize {
    current("set_max_workers").sched.set_max_workers(n)
}

/// Wire the current task to the worker running it: it will only run there, and the worker runs
/// nothing else.
pub fn lock_os_thread() {
    let cx = current("lock_os_thread");
    cx.sched.lock_os_thread(&cx);
}

pub fn unlock_os_thread() {
    let cx = current("unlock_os_thread");
    cx.sched.unlock_os_thread(&cx);
}

#[must_use]
pub fn locked_os_thread() -> bool {
    let cx = current("locked_os_thread");
    cx.sched.locked_os_thread(&cx)
}

/// Make the current task its worker's idle task: once readied it only runs when its worker has
/// nothing else to do.
pub fn idle_goroutine() {
    let cx = current("idle_goroutine");
    cx.sched.idle_goroutine(&cx);
}

/// Tasks alive in the current runtime.
#[must_use]
pub fn num_goroutine() -> usize {
    current("num_goroutine").sched.stats().tasks
}

/// Workers created by the current runtime.
#[must_use]
pub fn mcount() -> usize {
    current("mcount").sched.stats().workers
}

/// Sample the current runtime's tasks `hz` times a second, delivering the samples to `func`.
/// `hz <= 0` or no `func` turns profiling off.
pub fn set_cpu_profile_rate(hz: i32, func: Option<ProfileFn>) {
    profile::set_cpu_profile_rate(&current("set_cpu_profile_rate").sched, hz, func);
}
