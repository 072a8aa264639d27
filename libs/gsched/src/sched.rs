// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler core.
//!
//! Tasks are multiplexed onto worker threads. At most `mcpumax` workers execute task code at any
//! one time; `mcpu` counts those that do. Workers in a blocking call, idle workers and workers
//! helping the collector don't count. All scheduler state lives behind a single lock, except for
//! the scheduling word, which the blocking-call fast paths update without it.
//!
//! A task that stops running always goes through [`Sched::schedule`] on its own worker, which
//! decides what happens to it and picks the next task to run: the task handed to this worker by
//! somebody else, the head of the global run queue, or nothing, in which case the worker goes
//! to sleep on its note until somebody hands it a task.

use crate::config::Config;
use crate::context::{self, Current};
use crate::note::Note;
use crate::profile::{self, Profiler};
use crate::task::{Entry, Exec, Suspend, TaskHeader, TaskId, TaskSlot, TaskStatus};
use crate::word::{MAX_WORKERS, SchedWord};
use crate::worker::{self, Worker, WorkerId, WorkerState};
use crate::{Error, Stats, fatal};
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;
use parking_lot::{Mutex, MutexGuard};
use segstack::{MAX_SPAWN_ARGS, Pc, STACK_GUARD, round_args};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

pub(crate) struct Sched {
    pub(crate) word: SchedWord,
    inner: Mutex<SchedInner>,
    /// Woken once `mcpu <= mcpumax` while a stop-the-world is waiting for workers to stop.
    pub(crate) stopped: Note,
    /// A stop-the-world is in progress or was requested.
    pub(crate) gcwaiting: AtomicBool,
    /// The global profiling rate.
    pub(crate) profilehz: AtomicU32,
    pub(crate) profiler: Profiler,
    pub(crate) config: Config,
    /// Woken when the runtime exits, so the maintenance task notices.
    pub(crate) maintenance: Note,
    started: AtomicBool,
    exiting: AtomicBool,
    this: Weak<Sched>,
}

pub(crate) struct SchedInner {
    /// Every task control block ever allocated, indexed by slot.
    tasks: Vec<TaskSlot>,
    /// Dead tasks available for reuse.
    gfree: Vec<usize>,
    /// The global run queue.
    runq: VecDeque<usize>,
    /// Tasks on the run queue.
    gwait: u32,
    /// Tasks alive (not Dead).
    gcount: u32,
    /// Tasks on a worker or about to be: running, runnable on a worker's nextg, or in a
    /// blocking call.
    grunning: u32,
    goidgen: u64,
    /// Idle workers, most recently idled last.
    idle: Vec<WorkerId>,
    mwait: u32,
    workers: Vec<WorkerState>,
    /// Worker to wake once the lock is released.
    mwakeup: Option<WorkerId>,
    gomaxprocs: u32,
    /// `run_main` is initializing; locking to the bootstrap worker is recorded in `lockmain`.
    init: bool,
    lockmain: bool,
    /// The maintenance task, exempt from deadlock detection.
    scavenger: Option<usize>,
    exit_code: Option<i32>,
}

/// The scheduler lock. Releasing it wakes the worker recorded in `mwakeup`, if any, so the
/// woken worker does not immediately block on the lock we still hold.
pub(crate) struct SchedGuard<'a> {
    sched: &'a Sched,
    inner: ManuallyDrop<MutexGuard<'a, SchedInner>>,
}

/// A task picked to run on a worker, along with its execution state.
pub(crate) struct Dispatch {
    pub(crate) task: TaskId,
    pub(crate) header: Arc<TaskHeader>,
    pub(crate) exec: Box<Exec>,
}

/// A task that stopped running on a worker.
pub(crate) struct Descheduled {
    pub(crate) task: TaskId,
    pub(crate) exec: Box<Exec>,
    pub(crate) stop: Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    Suspended(Suspend),
    Exited,
}

// === impl Sched ===

impl Sched {
    /// Bring up the scheduler with the bootstrap worker accounted as running, so nothing else
    /// runs until the bootstrap worker enters the scheduler.
    pub(crate) fn new(config: Config) -> Arc<Self> {
        let word = SchedWord::new();
        word.set_mcpu_max(1);
        let admitted = word.can_add_mcpu();
        debug_assert!(admitted);

        let mut m0 = WorkerState::new(Arc::new(Worker::new(WorkerId::BOOTSTRAP)));
        m0.helpgc = true;

        let gomaxprocs = config.max_workers;
        Arc::new_cyclic(|this| Self {
            word,
            inner: Mutex::new(SchedInner {
                tasks: Vec::new(),
                gfree: Vec::new(),
                runq: VecDeque::new(),
                gwait: 0,
                gcount: 0,
                grunning: 1,
                goidgen: 0,
                idle: Vec::new(),
                mwait: 0,
                workers: vec![m0],
                mwakeup: None,
                gomaxprocs,
                init: false,
                lockmain: false,
                scavenger: None,
                exit_code: None,
            }),
            stopped: Note::new(),
            gcwaiting: AtomicBool::new(false),
            profilehz: AtomicU32::new(0),
            profiler: Profiler::new(),
            config,
            maintenance: Note::new(),
            started: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub(crate) fn lock(&self) -> SchedGuard<'_> {
        SchedGuard {
            sched: self,
            inner: ManuallyDrop::new(self.inner.lock()),
        }
    }

    /// Look at the scheduler state for diagnostics, giving up if the lock can't be had quickly.
    pub(crate) fn try_inspect<R>(&self, f: impl FnOnce(&SchedInner) -> R) -> Option<R> {
        let inner = self.inner.try_lock_for(Duration::from_millis(100))?;
        Some(f(&inner))
    }

    pub(crate) fn worker(&self, id: WorkerId) -> Arc<Worker> {
        self.lock().workers[id.as_usize()].shared.clone()
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Whether a running task should give up its worker at the next call boundary.
    pub(crate) fn preempt_requested(&self, worker: &Worker) -> bool {
        if worker.is_gcing() {
            return false;
        }
        if self.gcwaiting.load(Ordering::Acquire) {
            return true;
        }
        let s = self.word.load();
        s.mcpu() > s.mcpu_max()
    }

    /// Called by a worker whose task stopped running (`prev`), or that has no task yet.
    /// Returns the next task to run, or `None` once the runtime exited.
    pub(crate) fn schedule(&self, m: WorkerId, prev: Option<Descheduled>) -> Option<Dispatch> {
        let mut g = self.lock();

        if let Some(prev) = prev {
            g.deschedule(m, prev);
        } else {
            let w = &mut g.workers[m.as_usize()];
            if w.helpgc {
                // The bootstrap worker and workers started to help the collector hold a
                // running slot without a task. Give it back.
                w.helpgc = false;
                if self.word.dec_mcpu().mcpu_negative() {
                    fatal::throw_locked(&g, "negative mcpu in scheduler");
                }
                g.grunning_dec();
            } else if w.nextg.is_none() {
                fatal::throw_locked(&g, "invalid m state in scheduler");
            }
        }

        let (t, g) = g.next_task(m)?;
        Some(g.dispatch(m, t))
    }

    /// Create a new task running `entry` with `args` copied onto its stack, and make it
    /// runnable.
    ///
    /// Fails with [`Error::Exited`] once the runtime exited; the entry is dropped.
    pub(crate) fn spawn(&self, entry: Entry, args: &[u8], gopc: Pc) -> Result<TaskId, Error> {
        if round_args(args.len()) > MAX_SPAWN_ARGS {
            fatal::throw("newproc: function arguments too large for new task");
        }
        let cur = context::worker_of(self);

        let mut g = self.lock();
        if g.exit_code.is_some() {
            drop(g);
            // the entry may own user state, don't drop it under the lock
            drop(entry);
            return Err(Error::Exited);
        }

        let t = match g.gfget() {
            Some(t) => t,
            None => g.malg(),
        };

        let armed = match g.tasks[t].exec.as_mut() {
            Some(exec) => exec.prepare(entry, args, gopc),
            None => fatal::throw_locked(&g, "invalid stack in newg"),
        };
        if let Err(err) = armed {
            fatal::throw_locked(&g, &format!("runtime: cannot start task: {err}"));
        }

        g.goidgen += 1;
        let id = TaskId::new(g.goidgen, t);
        let slot = &mut g.tasks[t];
        slot.id = id;
        slot.gopc = gopc;
        slot.wait_reason = "new goroutine";
        slot.header.clear_gc_stack();
        slot.header.set_status(TaskStatus::Waiting);
        g.gcount += 1;

        tracing::trace!(task = id.as_u64(), slot = t, "spawned");
        g.readylocked(cur, t);
        Ok(id)
    }

    /// Mark a waiting task runnable.
    pub(crate) fn ready(&self, task: TaskId) {
        let cur = context::worker_of(self);
        let mut g = self.lock();
        if g.tasks.get(task.slot()).is_none_or(|slot| slot.id != task) {
            fatal::throw_locked(&g, &format!("ready of unknown task {task}"));
        }
        g.readylocked(cur, task.slot());
    }

    /// The current task is about to block in the host. Give up its running slot without
    /// giving up the worker.
    pub(crate) fn enter_blocking(&self, cx: &Current) {
        if self.profilehz.load(Ordering::Relaxed) > 0 {
            profile::set_prof(false);
        }

        let bounds = context::locals(|locals| locals.stack.bounds());
        cx.header.record_gc_stack(bounds);
        cx.header.set_status(TaskStatus::Syscall);
        if bounds.sp < bounds.guard - STACK_GUARD || bounds.base < bounds.sp {
            tracing::error!(?bounds, "inconsistent stack on blocking call entry");
            fatal::throw("entersyscall");
        }

        // Fast path: nobody needs to hear about it.
        let s = self.word.dec_mcpu();
        if !s.needs_attention() {
            return;
        }

        let mut g = self.lock();
        if self.word.load().gwaiting() {
            g.matchmg(Some(cx.worker_id()));
        }
        let s = self.word.load();
        if s.waitstop() && s.mcpu() <= s.mcpu_max() {
            self.word.clear_waitstop();
            self.stopped.wakeup();
        }
    }

    /// The current task returned from a blocking call. Returns `false` if there was no running
    /// slot to be had, in which case the task must suspend with [`Suspend::ExitBlocking`] and
    /// wait to be rescheduled.
    pub(crate) fn exit_blocking(&self, cx: &Current) -> bool {
        let s = self.word.inc_mcpu();
        let hz = self.profilehz.load(Ordering::Relaxed);
        if cx.worker.profilehz.load(Ordering::Relaxed) == hz && s.mcpu() <= s.mcpu_max() {
            cx.header.set_status(TaskStatus::Running);
            cx.header.clear_gc_stack();
            if hz > 0 {
                profile::set_prof(true);
            }
            return true;
        }
        false
    }

    /// Stop every other worker from running task code. Returns once the caller is the only one.
    pub(crate) fn stop_the_world(&self, cx: &Current) {
        let mut g = self.lock();
        cx.worker.gcing.store(true, Ordering::Release);
        self.gcwaiting.store(true, Ordering::Release);
        self.word.set_mcpu_max(1);

        loop {
            let s = self.word.load();
            if s.mcpu() <= 1 {
                break;
            }
            self.stopped.clear();
            if s.waitstop() {
                fatal::throw_locked(&g, "invalid waitstop");
            }
            if !self.word.try_set_waitstop(s) {
                continue;
            }

            drop(g);
            self.stopped.sleep();
            g = self.lock();
        }

        drop(g);
        tracing::debug!("world stopped");
    }

    /// Undo [`Self::stop_the_world`]. With `extra`, also start one more worker to pick up the
    /// running slot a helper could not be found for.
    pub(crate) fn start_the_world(&self, cx: &Current, extra: bool) {
        let mut g = self.lock();
        cx.worker.gcing.store(false, Ordering::Release);
        self.gcwaiting.store(false, Ordering::Release);
        self.word.set_mcpu_max(g.gomaxprocs);
        g.matchmg(Some(cx.worker_id()));

        if extra && self.word.can_add_mcpu() {
            // The new worker starts out in the scheduler without a task, holding the slot we
            // just reserved for it.
            let m = g.new_worker();
            g.workers[m.as_usize()].helpgc = true;
            g.grunning += 1;
        }
        tracing::debug!(extra, "world started");
    }

    /// Recruit idle workers to run the collector's helper. Returns the number recruited and
    /// whether fewer could be found than wanted.
    pub(crate) fn help_gc(&self) -> (usize, bool) {
        let ncpu = std::thread::available_parallelism().map_or(1, usize::from);
        let mut g = self.lock();
        let max = (g.gomaxprocs as usize)
            .min(ncpu)
            .min(self.config.max_gc_procs)
            .saturating_sub(1);

        let mut n = 0;
        while n < max {
            let Some(m) = g.mget(None) else {
                break;
            };
            let w = &mut g.workers[m.as_usize()];
            w.helpgc = true;
            w.waitnextg = false;
            w.shared.havenextg.wakeup();
            n += 1;
        }
        tracing::debug!(helpers = n, wanted = max, "recruited collector helpers");
        (n, n != max)
    }

    /// Change the concurrency limit. `n == 0` leaves it unchanged. Returns the previous limit.
    pub(crate) fn set_max_workers(&self, n: usize) -> usize {
        let cur = context::worker_of(self);
        let mut g = self.lock();
        let prev = g.gomaxprocs;
        let n = match u32::try_from(n) {
            Ok(0) => prev,
            Ok(n) => n.min(MAX_WORKERS),
            Err(_) => MAX_WORKERS,
        };
        g.gomaxprocs = n;

        if self.gcwaiting.load(Ordering::Acquire) {
            if self.word.load().mcpu_max() != 1 {
                fatal::throw_locked(&g, "invalid mcpumax during gc");
            }
            return prev as usize;
        }

        self.word.set_mcpu_max(n);
        tracing::debug!(prev, max = n, "max workers changed");
        if self.word.load().mcpu() > n {
            // Too many running, we are one of them: make room.
            drop(g);
            if cur.is_some() {
                context::suspend(Suspend::Yield);
            }
            return prev as usize;
        }
        g.matchmg(cur);
        prev as usize
    }

    /// Wire the current task to its worker.
    pub(crate) fn lock_os_thread(&self, cx: &Current) {
        let m = cx.worker_id();
        let mut g = self.lock();
        if m == WorkerId::BOOTSTRAP && g.init {
            g.lockmain = true;
            return;
        }
        let t = cx.task.slot();
        g.workers[m.as_usize()].lockedg = Some(t);
        g.tasks[t].locked_worker = Some(m);
    }

    pub(crate) fn unlock_os_thread(&self, cx: &Current) {
        let m = cx.worker_id();
        let mut g = self.lock();
        if m == WorkerId::BOOTSTRAP && g.init {
            g.lockmain = false;
            return;
        }
        let t = cx.task.slot();
        g.workers[m.as_usize()].lockedg = None;
        g.tasks[t].locked_worker = None;
    }

    pub(crate) fn locked_os_thread(&self, cx: &Current) -> bool {
        let g = self.lock();
        let t = cx.task.slot();
        g.tasks[t].locked_worker.is_some()
            && g.workers[cx.worker_id().as_usize()].lockedg == Some(t)
    }

    /// Make the current task its worker's idle task.
    pub(crate) fn idle_goroutine(&self, cx: &Current) {
        let mut g = self.lock();
        let t = cx.task.slot();
        if g.tasks[t].idle_worker.is_some() {
            fatal::throw_locked(&g, "g is already an idle goroutine");
        }
        g.tasks[t].idle_worker = Some(cx.worker_id());
    }

    /// Raise the concurrency limit and mark initialization as started, for `run_main`.
    pub(crate) fn begin_init(&self) {
        let mut g = self.lock();
        self.word.set_mcpu_max(g.gomaxprocs);
        g.init = true;
    }

    /// Returns whether initialization asked to stay locked to the bootstrap worker.
    pub(crate) fn end_init(&self) -> bool {
        let mut g = self.lock();
        g.init = false;
        g.lockmain
    }

    pub(crate) fn set_scavenger(&self, task: TaskId) {
        self.lock().scavenger = Some(task.slot());
    }

    /// Bring the running-slot limit up to the configured concurrency and hand out the tasks
    /// spawned so far. Called on the bootstrap thread right before it enters the worker loop.
    pub(crate) fn start(&self) -> bool {
        let mut g = self.lock();
        if g.gcount == 0 {
            return false;
        }
        self.word.set_mcpu_max(g.gomaxprocs);
        g.matchmg(None);
        true
    }

    /// Shut the runtime down with `code`. Workers return from their loop the next time they
    /// enter the scheduler.
    pub(crate) fn exit(&self, code: i32) {
        self.lock().exit(code);
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub(crate) fn stats(&self) -> Stats {
        let g = self.lock();
        let s = self.word.load();
        Stats {
            tasks: g.gcount as usize,
            free: g.gfree.len(),
            runnable: g.gwait as usize,
            running: g.grunning as usize,
            workers: g.workers.len(),
            idle_workers: g.mwait as usize,
            max_workers: g.gomaxprocs as usize,
            mcpu: s.mcpu() as usize,
            mcpu_max: s.mcpu_max() as usize,
        }
    }

    pub(crate) fn status(&self, task: TaskId) -> Option<TaskStatus> {
        let g = self.lock();
        let slot = g.tasks.get(task.slot()).filter(|slot| slot.id == task)?;
        Some(slot.status())
    }

    pub(crate) fn gc_stack(&self, task: TaskId) -> Option<crate::GcStackBounds> {
        let g = self.lock();
        let slot = g.tasks.get(task.slot()).filter(|slot| slot.id == task)?;
        slot.header.gc_stack()
    }

    fn arc(&self) -> Arc<Sched> {
        self.this
            .upgrade()
            .unwrap_or_else(|| fatal::throw("scheduler used after it was dropped"))
    }
}

impl fmt::Debug for Sched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sched")
            .field("word", &self.word)
            .field("gcwaiting", &self.gcwaiting.load(Ordering::Relaxed))
            .field("profilehz", &self.profilehz.load(Ordering::Relaxed))
            .field("exiting", &self.is_exiting())
            .finish_non_exhaustive()
    }
}

// === impl SchedInner ===

impl SchedInner {
    pub(crate) fn tasks(&self) -> &[TaskSlot] {
        &self.tasks
    }

    fn grunning_dec(&mut self) {
        match self.grunning.checked_sub(1) {
            Some(n) => self.grunning = n,
            None => fatal::throw_locked(self, "negative grunning"),
        }
    }

    /// Whether there is a task this worker could run.
    fn haveg(&self, m: Option<WorkerId>) -> bool {
        !self.runq.is_empty() || m.is_some_and(|m| self.workers[m.as_usize()].idleg.is_some())
    }

    /// Pop the next runnable task: the run queue first, then this worker's idle task.
    fn gget(&mut self, m: Option<WorkerId>) -> Option<usize> {
        if let Some(t) = self.runq.pop_front() {
            self.gwait -= 1;
            return Some(t);
        }
        m.and_then(|m| self.workers[m.as_usize()].idleg.take())
    }

    /// Put a worker on the idle list.
    fn mput(&mut self, m: WorkerId) {
        self.idle.push(m);
        self.mwait += 1;
    }

    /// Get a worker to run `t`: the one `t` is locked to, or an idle one.
    fn mget(&mut self, t: Option<usize>) -> Option<WorkerId> {
        if let Some(m) = t.and_then(|t| self.tasks[t].locked_worker) {
            return Some(m);
        }
        let m = self.idle.pop()?;
        self.mwait -= 1;
        Some(m)
    }
}

impl fmt::Debug for SchedInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedInner")
            .field("tasks", &self.tasks.len())
            .field("gfree", &self.gfree.len())
            .field("gwait", &self.gwait)
            .field("gcount", &self.gcount)
            .field("grunning", &self.grunning)
            .field("mcount", &self.workers.len())
            .field("mwait", &self.mwait)
            .field("gomaxprocs", &self.gomaxprocs)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

// === impl SchedGuard ===

impl SchedGuard<'_> {
    /// Put a runnable task somewhere a worker will find it.
    fn gput(&mut self, t: usize) {
        // A locked task goes straight back to its worker, if there is room to run it.
        if let Some(m) = self.tasks[t].locked_worker
            && self.sched.word.can_add_mcpu()
        {
            self.mnextg(m, t);
            return;
        }

        // An idle task goes to its worker's idle slot, to be run only when there is nothing else.
        if let Some(m) = self.tasks[t].idle_worker {
            if self.workers[m.as_usize()].idleg.is_some() {
                fatal::throw_locked(self, "runtime: double idle");
            }
            self.workers[m.as_usize()].idleg = Some(t);
            return;
        }

        self.runq.push_back(t);
        if self.gwait == 0 {
            self.sched.word.set_gwaiting(true);
        }
        self.gwait += 1;
    }

    fn gget(&mut self, m: Option<WorkerId>) -> Option<usize> {
        let t = self.inner.gget(m);
        if t.is_some() && self.gwait == 0 && self.sched.word.load().gwaiting() {
            self.sched.word.set_gwaiting(false);
        }
        t
    }

    /// Hand `t` to worker `m`, waking it if it is waiting for work.
    fn mnextg(&mut self, m: WorkerId, t: usize) {
        self.grunning += 1;
        let w = &mut self.workers[m.as_usize()];
        w.nextg = Some(t);
        if w.waitnextg {
            w.waitnextg = false;
            if let Some(prev) = self.mwakeup.replace(m) {
                self.workers[prev.as_usize()].shared.havenextg.wakeup();
            }
        }
    }

    fn readylocked(&mut self, cur: Option<WorkerId>, t: usize) {
        let slot = &mut self.tasks[t];

        // Still running on a worker: let that worker requeue it once it has stopped.
        if slot.worker.is_some() {
            slot.ready_on_stop = true;
            return;
        }

        let status = slot.status();
        if !matches!(status, TaskStatus::Waiting | TaskStatus::Syscall) {
            let msg = format!("bad g->status in ready: task {} is {status}", slot.id);
            fatal::throw_locked(self, &msg);
        }
        self.tasks[t].header.set_status(TaskStatus::Runnable);
        self.gput(t);
        self.matchmg(cur);
    }

    /// Pair runnable tasks with workers while there are free running slots.
    fn matchmg(&mut self, cur: Option<WorkerId>) {
        if cur.is_some_and(|m| self.workers[m.as_usize()].shared.is_gcing()) {
            return;
        }
        if self.exit_code.is_some() {
            return;
        }

        while self.haveg(cur) && self.sched.word.can_add_mcpu() {
            let Some(t) = self.gget(cur) else {
                fatal::throw_locked(self, "gget inconsistency");
            };
            let m = match self.mget(Some(t)) {
                Some(m) => m,
                None => self.new_worker(),
            };
            self.mnextg(m, t);
        }
    }

    /// Allocate and start a new worker.
    pub(crate) fn new_worker(&mut self) -> WorkerId {
        let id = WorkerId::new(self.workers.len());
        self.workers
            .push(WorkerState::new(Arc::new(Worker::new(id))));

        // The thread can't get anywhere before we release the lock.
        if let Err(err) = worker::start_thread(self.sched.arc(), id) {
            tracing::error!(%err, worker = %id, "failed to start worker thread");
            fatal::throw_locked(self, "runtime.newosproc");
        }
        tracing::debug!(worker = %id, "new worker");
        id
    }

    /// Take a control block off the free list.
    fn gfget(&mut self) -> Option<usize> {
        let t = self.gfree.pop()?;
        if !self.tasks[t]
            .exec
            .as_ref()
            .is_some_and(|exec| exec.stack_is_pristine())
        {
            fatal::throw_locked(self, "invalid stack in newg");
        }
        Some(t)
    }

    /// Allocate a fresh control block.
    fn malg(&mut self) -> usize {
        let t = self.tasks.len();
        let exec = Exec::new(
            self.sched.config.segments.clone(),
            self.sched.config.task_stack_size,
        );
        match exec {
            Ok(exec) => self.tasks.push(TaskSlot::new(exec, t)),
            Err(err) => fatal::throw_locked(self, &format!("runtime: cannot allocate task: {err}")),
        }
        t
    }

    /// Apply the outcome of a task stopping on worker `m`.
    fn deschedule(&mut self, m: WorkerId, prev: Descheduled) {
        let Descheduled { task, exec, stop } = prev;
        let t = task.slot();

        self.workers[m.as_usize()].curg = None;
        let slot = &mut self.tasks[t];
        slot.worker = None;
        slot.exec = Some(exec);
        match stop {
            Stop::Suspended(Suspend::Yield) => {}
            Stop::Suspended(Suspend::Park(reason)) => {
                slot.wait_reason = reason;
                slot.header.set_status(TaskStatus::Waiting);
            }
            Stop::Suspended(Suspend::ExitBlocking) => slot.ready_on_stop = true,
            Stop::Exited => slot.header.set_status(TaskStatus::Moribund),
        }

        self.grunning_dec();
        if self.sched.word.dec_mcpu().mcpu_negative() {
            fatal::throw_locked(self, "negative mcpu in scheduler");
        }

        match self.tasks[t].status() {
            status @ (TaskStatus::Idle | TaskStatus::Runnable | TaskStatus::Dead) => {
                let msg = format!("bad gp->status in sched: task {task} is {status}");
                fatal::throw_locked(self, &msg);
            }
            TaskStatus::Running => {
                self.tasks[t].header.set_status(TaskStatus::Runnable);
                self.gput(t);
            }
            TaskStatus::Moribund => self.retire(m, t),
            TaskStatus::Syscall | TaskStatus::Waiting => {}
        }

        if self.tasks[t].ready_on_stop {
            self.tasks[t].ready_on_stop = false;
            self.readylocked(Some(m), t);
        }
    }

    /// A task finished: release its resources and put its control block on the free list.
    fn retire(&mut self, m: WorkerId, t: usize) {
        let slot = &mut self.tasks[t];
        slot.header.set_status(TaskStatus::Dead);
        slot.ready_on_stop = false;
        slot.idle_worker = None;
        let was_locked = slot.locked_worker.take().is_some();
        let retired = slot.exec.as_mut().map(|exec| exec.retire());
        tracing::trace!(task = slot.id.as_u64(), "task exited");

        if was_locked {
            self.workers[m.as_usize()].lockedg = None;
        }
        if let Some(Err(err)) = retired {
            tracing::error!(%err, "task stack not reusable");
            fatal::throw_locked(self, "invalid stack in gfput");
        }
        if self.scavenger == Some(t) {
            self.scavenger = None;
        }

        self.gfree.push(t);
        self.gcount -= 1;
        if self.gcount == 0 {
            self.exit(0);
        }
    }

    /// Shut the runtime down with `code`. Workers return from their loop the next time they
    /// enter the scheduler; sleeping ones are woken.
    pub(crate) fn exit(&mut self, code: i32) {
        if self.exit_code.is_some() {
            return;
        }
        tracing::debug!(code, "runtime exiting");
        self.exit_code = Some(code);
        self.sched.exiting.store(true, Ordering::Release);

        for w in &mut self.inner.workers {
            if w.waitnextg {
                w.waitnextg = false;
                w.shared.havenextg.wakeup();
            }
        }
        self.sched.maintenance.wakeup();
    }

    /// Pick the next task for worker `m`, sleeping until one is handed over if there is none.
    /// Returns with the lock held, or `None` once the runtime exited.
    fn next_task(mut self, m: WorkerId) -> Option<(usize, Self)> {
        let mi = m.as_usize();
        loop {
            if self.exit_code.is_some() {
                return None;
            }
            if self.sched.word.load().mcpu() >= MAX_WORKERS {
                fatal::throw_locked(&self, "negative mcpu");
            }

            // handed over by somebody else
            if let Some(t) = self.workers[mi].nextg.take() {
                return Some((t, self));
            }

            if self.workers[mi].lockedg.is_some() {
                // Can only run the locked task, which somebody else has to hand to us.
                // Meanwhile, pass queued work on to other workers.
                if self.gwait != 0 {
                    self.matchmg(Some(m));
                    if let Some(t) = self.workers[mi].nextg.take() {
                        return Some((t, self));
                    }
                }
            } else {
                while self.haveg(Some(m)) && self.sched.word.can_add_mcpu() {
                    let Some(t) = self.gget(Some(m)) else {
                        fatal::throw_locked(&self, "gget inconsistency");
                    };
                    if let Some(lm) = self.tasks[t].locked_worker {
                        // belongs to somebody else
                        self.mnextg(lm, t);
                        continue;
                    }
                    self.grunning += 1;
                    return Some((t, self));
                }
                self.mput(m);
            }

            self.check_deadlock();

            let w = &mut self.workers[mi];
            w.nextg = None;
            w.waitnextg = true;
            let shared = w.shared.clone();
            shared.havenextg.clear();

            let s = self.sched.word.load();
            if s.waitstop() && s.mcpu() <= s.mcpu_max() {
                self.sched.word.clear_waitstop();
                self.sched.stopped.wakeup();
            }

            let sched = self.sched;
            drop(self);
            tracing::trace!("worker idle");
            shared.havenextg.sleep();
            self = sched.lock();

            if self.exit_code.is_some() {
                return None;
            }
            if self.workers[mi].helpgc {
                drop(self);
                if let Some(collector) = &sched.config.collector {
                    collector.gchelper(m);
                }
                self = sched.lock();
                self.workers[mi].helpgc = false;
                continue;
            }

            return match self.workers[mi].nextg.take() {
                Some(t) => Some((t, self)),
                None => fatal::throw_locked(&self, "bad m->nextg in nextgoroutine"),
            };
        }
    }

    /// Nothing can run and nothing is in a blocking call that could wake anybody up.
    ///
    /// With a maintenance task this is only detected when it is the one task left on a worker
    /// (sitting in its blocking sleep); a program whose only runnable work depends on the
    /// maintenance task waking it is not reported.
    fn check_deadlock(&self) {
        let deadlocked = match self.scavenger {
            None => self.grunning == 0,
            Some(t) => {
                self.grunning == 1
                    && self.gwait == 0
                    && matches!(
                        self.tasks[t].status(),
                        TaskStatus::Running | TaskStatus::Syscall
                    )
            }
        };
        if deadlocked {
            fatal::throw_locked(self, "all goroutines are asleep - deadlock!");
        }
    }

    /// Mark `t` as running on worker `m` and take its execution state out of the registry.
    fn dispatch(mut self, m: WorkerId, t: usize) -> Dispatch {
        let slot = &mut self.tasks[t];
        slot.ready_on_stop = false;
        slot.header.set_status(TaskStatus::Running);
        slot.worker = Some(m);
        let task = slot.id;
        let header = slot.header.clone();
        let Some(exec) = slot.exec.take() else {
            fatal::throw_locked(&self, "task dispatched twice");
        };
        self.workers[m.as_usize()].curg = Some(t);

        let worker = self.workers[m.as_usize()].shared.clone();
        let hz = self.sched.profilehz.load(Ordering::Relaxed);
        drop(self);

        if worker.profilehz.load(Ordering::Relaxed) != hz {
            profile::reset_cpu_profiler(&worker, hz);
        }

        Dispatch { task, header, exec }
    }
}

impl Deref for SchedGuard<'_> {
    type Target = SchedInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for SchedGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for SchedGuard<'_> {
    fn drop(&mut self) {
        let wake = self
            .inner
            .mwakeup
            .take()
            .map(|m| self.inner.workers[m.as_usize()].shared.clone());
        // SAFETY: the guard is dropped exactly once, here, and never touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        if let Some(worker) = wake {
            worker.havenextg.wakeup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Builder;

    fn sched(max_workers: usize) -> Arc<Sched> {
        Sched::new(Builder::new().max_workers(max_workers).into_config())
    }

    #[test]
    fn bootstrap_holds_one_slot() {
        let sched = sched(4);
        let s = sched.word.load();
        assert_eq!(s.mcpu(), 1);
        assert_eq!(s.mcpu_max(), 1);

        let stats = sched.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.max_workers, 4);
        assert_eq!(stats.tasks, 0);
    }

    #[test]
    fn spawned_tasks_queue_until_started() {
        let sched = sched(4);
        let a = sched.spawn(Box::new(|_| {}), &[], Pc::caller()).unwrap();
        let b = sched.spawn(Box::new(|_| {}), &[1, 2, 3], Pc::caller()).unwrap();
        assert!(a.as_u64() < b.as_u64());

        let stats = sched.stats();
        assert_eq!(stats.tasks, 2);
        assert_eq!(stats.runnable, 2);
        assert_eq!(sched.status(a), Some(TaskStatus::Runnable));
        assert!(sched.word.load().gwaiting());

        let mut g = sched.lock();
        assert_eq!(g.gget(None), Some(a.slot()));
        assert_eq!(g.gget(None), Some(b.slot()));
        assert!(!sched.word.load().gwaiting());
        assert_eq!(g.gget(None), None);
    }

    #[test]
    fn idle_list_is_lifo() {
        let sched = sched(1);
        let mut g = sched.lock();
        g.mput(WorkerId::new(3));
        g.mput(WorkerId::new(5));
        assert_eq!(g.mwait, 2);
        assert_eq!(g.mget(None), Some(WorkerId::new(5)));
        assert_eq!(g.mget(None), Some(WorkerId::new(3)));
        assert_eq!(g.mget(None), None);
        assert_eq!(g.mwait, 0);
    }

    #[test]
    fn mnextg_defers_wakeup_until_unlock() {
        let sched = sched(2);
        let t = sched.spawn(Box::new(|_| {}), &[], Pc::caller()).unwrap();

        let mut g = sched.lock();
        let t = g.gget(None).unwrap_or(t.slot());
        g.workers[0].waitnextg = true;
        g.workers[0].shared.havenextg.clear();
        g.mnextg(WorkerId::BOOTSTRAP, t);

        assert_eq!(g.mwakeup, Some(WorkerId::BOOTSTRAP));
        assert!(!g.workers[0].waitnextg);
        let worker = g.workers[0].shared.clone();
        assert!(!worker.havenextg.is_woken());
        drop(g);
        assert!(worker.havenextg.is_woken());
    }

    #[test]
    fn set_max_workers_clamps_and_reports_previous() {
        let sched = sched(2);
        assert_eq!(sched.set_max_workers(0), 2);
        assert_eq!(sched.set_max_workers(usize::MAX), 2);
        assert_eq!(sched.stats().max_workers, MAX_WORKERS as usize);
        assert_eq!(sched.set_max_workers(3), MAX_WORKERS as usize);
        assert_eq!(sched.word.load().mcpu_max(), 3);
    }

    #[test]
    fn help_gc_without_idle_workers() {
        let sched = sched(4);
        let (n, extra) = sched.help_gc();
        assert_eq!(n, 0);
        let ncpu = std::thread::available_parallelism().map_or(1, usize::from);
        assert_eq!(extra, 4.min(ncpu) > 1);
    }
}
