// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Runtime;
use crate::word::MAX_WORKERS;
use crate::worker::{ThreadStart, WorkerId};
use core::fmt;
use core::time::Duration;
use segstack::{SegmentAllocator, StackPool};
use std::sync::Arc;

/// Environment variable holding the initial concurrency limit.
pub const ENV_MAX_WORKERS: &str = "GSCHED_MAXPROCS";
/// Environment variable holding the traceback level for fatal errors. `0` prints only the
/// message, anything else also prints task tracebacks.
pub const ENV_TRACEBACK: &str = "GSCHED_TRACEBACK";

const DEFAULT_MAX_GC_PROCS: usize = 4;
const DEFAULT_TASK_STACK_SIZE: usize = 256 * 1024;

/// Hooks into the garbage collector that drives stop-the-world.
pub trait Collector: Send + Sync {
    /// Run on an idle worker recruited by [`help_gc`](crate::help_gc) while the world is stopped.
    fn gchelper(&self, worker: WorkerId) {
        let _ = worker;
    }

    /// Run periodically by the maintenance task.
    fn scavenge(&self) {}
}

pub type ThreadStartFn = Arc<dyn Fn(ThreadStart) + Send + Sync>;

/// Configures and builds a [`Runtime`].
#[derive(Default)]
pub struct Builder {
    max_workers: Option<usize>,
    traceback: Option<u32>,
    max_gc_procs: Option<usize>,
    task_stack_size: Option<usize>,
    segments: Option<Arc<dyn SegmentAllocator>>,
    collector: Option<Arc<dyn Collector>>,
    maintenance: Option<Duration>,
    thread_start: Option<ThreadStartFn>,
}

/// The resolved configuration.
#[derive(Clone)]
pub(crate) struct Config {
    pub(crate) max_workers: u32,
    pub(crate) traceback: u32,
    pub(crate) max_gc_procs: usize,
    pub(crate) task_stack_size: usize,
    pub(crate) segments: Arc<dyn SegmentAllocator>,
    pub(crate) collector: Option<Arc<dyn Collector>>,
    pub(crate) maintenance: Option<Duration>,
    pub(crate) thread_start: Option<ThreadStartFn>,
}

// === impl Builder ===

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of workers executing task code at once. Defaults to the value of
    /// `GSCHED_MAXPROCS`, or 1.
    #[must_use]
    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = Some(n);
        self
    }

    /// Traceback level for fatal errors. Defaults to the value of `GSCHED_TRACEBACK`, or 1.
    #[must_use]
    pub fn traceback(mut self, level: u32) -> Self {
        self.traceback = Some(level);
        self
    }

    /// Cap on the number of workers running the collector at once (including the one that
    /// stopped the world).
    #[must_use]
    pub fn max_gc_procs(mut self, n: usize) -> Self {
        self.max_gc_procs = Some(n);
        self
    }

    /// Size of the machine stack each task runs on.
    #[must_use]
    pub fn task_stack_size(mut self, bytes: usize) -> Self {
        self.task_stack_size = Some(bytes);
        self
    }

    /// Backing store for segmented stack segments.
    #[must_use]
    pub fn segment_allocator(mut self, alloc: Arc<dyn SegmentAllocator>) -> Self {
        self.segments = Some(alloc);
        self
    }

    #[must_use]
    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Run a maintenance task that calls [`Collector::scavenge`] every `period`. Only used by
    /// [`Runtime::run_main`].
    #[must_use]
    pub fn maintenance(mut self, period: Duration) -> Self {
        self.maintenance = Some(period);
        self
    }

    /// Start worker threads through `hook` instead of [`std::thread::spawn`].
    #[must_use]
    pub fn thread_start(mut self, hook: impl Fn(ThreadStart) + Send + Sync + 'static) -> Self {
        self.thread_start = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        Runtime::from_config(self.into_config())
    }

    pub(crate) fn into_config(self) -> Config {
        let max_workers = self
            .max_workers
            .or_else(|| env_number(ENV_MAX_WORKERS))
            .filter(|n| *n > 0)
            .unwrap_or(1);

        Config {
            max_workers: u32::try_from(max_workers).map_or(MAX_WORKERS, |n| n.min(MAX_WORKERS)),
            traceback: self.traceback.unwrap_or_else(env_traceback),
            max_gc_procs: self.max_gc_procs.unwrap_or(DEFAULT_MAX_GC_PROCS).max(1),
            task_stack_size: self.task_stack_size.unwrap_or(DEFAULT_TASK_STACK_SIZE),
            segments: self
                .segments
                .unwrap_or_else(|| Arc::new(StackPool::default())),
            collector: self.collector,
            maintenance: self.maintenance,
            thread_start: self.thread_start,
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("max_workers", &self.max_workers)
            .field("traceback", &self.traceback)
            .field("max_gc_procs", &self.max_gc_procs)
            .field("task_stack_size", &self.task_stack_size)
            .field("segments", &self.segments.is_some())
            .field("collector", &self.collector.is_some())
            .field("maintenance", &self.maintenance)
            .field("thread_start", &self.thread_start.is_some())
            .finish()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_workers", &self.max_workers)
            .field("traceback", &self.traceback)
            .field("max_gc_procs", &self.max_gc_procs)
            .field("task_stack_size", &self.task_stack_size)
            .field("collector", &self.collector.is_some())
            .field("maintenance", &self.maintenance)
            .field("thread_start", &self.thread_start.is_some())
            .finish_non_exhaustive()
    }
}

/// The traceback level from the environment, for fatal errors raised outside of any runtime.
pub(crate) fn env_traceback() -> u32 {
    env_number(ENV_TRACEBACK).unwrap_or(1)
}

fn env_number<T: core::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_values_win() {
        let config = Builder::new()
            .max_workers(3)
            .traceback(0)
            .max_gc_procs(2)
            .task_stack_size(64 * 1024)
            .into_config();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.traceback, 0);
        assert_eq!(config.max_gc_procs, 2);
        assert_eq!(config.task_stack_size, 64 * 1024);
        assert!(config.collector.is_none());
    }

    #[test]
    fn max_workers_is_clamped() {
        let config = Builder::new().max_workers(1 << 20).into_config();
        assert_eq!(config.max_workers, MAX_WORKERS);
    }

    #[test]
    fn zero_max_gc_procs_means_one() {
        let config = Builder::new().max_gc_procs(0).into_config();
        assert_eq!(config.max_gc_procs, 1);
    }
}
