// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use gsched::{Collector, Error, Runtime, Semaphore, TaskId, TaskStatus, WorkerId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn spin(d: Duration) {
    let start = Instant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}

#[test]
fn run_without_tasks() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(2).build();
    assert_eq!(rt.run(), Ok(0));
    assert_eq!(rt.run(), Err(Error::AlreadyStarted));
}

#[test]
fn run_returns_once_all_tasks_finished() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(3).build();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        rt.spawn(move |_| {
            gsched::yield_now();
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(rt.num_goroutine(), 10);

    assert_eq!(rt.run(), Ok(0));
    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert_eq!(rt.num_goroutine(), 0);
    assert!(matches!(rt.spawn(|_| {}), Err(Error::Exited)));
}

#[test]
fn task_ids_increase_and_slots_are_reused() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(1).build();
    let ids = Arc::new(Mutex::new(Vec::new()));
    let code = rt.run_main({
        let ids = ids.clone();
        move |_| {
            for _ in 0..3 {
                let sema = Arc::new(Semaphore::new(0));
                let s = sema.clone();
                let id = gsched::spawn(move |_| s.release());
                ids.lock().push(id);
                sema.acquire();
                // let the child finish and retire
                gsched::yield_now();
            }
        }
    });
    assert_eq!(code, Ok(0));

    let ids = ids.lock();
    assert!(ids.windows(2).all(|w| w[0].as_u64() < w[1].as_u64()));
    assert!(matches!(rt.status(ids[0]), None | Some(TaskStatus::Dead)));
    assert!(rt.stats().free >= 1);
}

#[test]
fn concurrency_limit_holds() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(2).build();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let running = running.clone();
        let peak = peak.clone();
        rt.spawn(move |_| {
            for _ in 0..20 {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                spin(Duration::from_micros(200));
                running.fetch_sub(1, Ordering::SeqCst);
                gsched::yield_now();
            }
        })
        .unwrap();
    }

    assert_eq!(rt.run(), Ok(0));
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    assert!(rt.mcount() <= 3);
}

#[test]
fn main_returning_ends_the_runtime() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(2).build();
    let code = rt.run_main(|_| {
        // never readied
        gsched::spawn(|_| gsched::park("forgotten"));
        gsched::yield_now();
    });
    assert_eq!(code, Ok(0));
}

#[test]
fn exit_code_is_reported() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(2).build();
    let after = Arc::new(AtomicBool::new(false));
    let code = rt.run_main({
        let after = after.clone();
        move |frame| {
            frame.defer(move |_| after.store(true, Ordering::SeqCst));
            gsched::exit(7);
        }
    });
    assert_eq!(code, Ok(7));
    // exit does not run deferred calls
    assert!(!after.load(Ordering::SeqCst));
}

#[test]
fn park_and_ready() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Arc::new(Runtime::builder().max_workers(2).build());
    let code = rt.run_main({
        let rt = rt.clone();
        move |_| {
            let parking = Arc::new(AtomicBool::new(false));
            let woke = Arc::new(Semaphore::new(0));

            let child = gsched::spawn({
                let parking = parking.clone();
                let woke = woke.clone();
                move |_| {
                    parking.store(true, Ordering::SeqCst);
                    gsched::park("test wait");
                    woke.release();
                }
            });

            while !parking.load(Ordering::SeqCst) {
                gsched::yield_now();
            }
            // Readying a task that is still on its way to parking is fine.
            gsched::ready(child);
            woke.acquire();
            assert_ne!(rt.status(child), Some(TaskStatus::Waiting));
        }
    });
    assert_eq!(code, Ok(0));
}

#[test]
fn ready_from_outside_the_runtime() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Arc::new(Runtime::builder().max_workers(2).build());
    let code = rt.run_main({
        let rt = rt.clone();
        move |_| {
            let me = gsched::current_task().unwrap();
            let (tx, rx) = std::sync::mpsc::channel::<()>();

            // Sits in a blocking call until the helper thread is done, so the deadlock
            // detector knows somebody may still wake us.
            gsched::spawn(move |_| gsched::blocking(move || rx.recv().unwrap()));

            let waker = {
                let rt = rt.clone();
                std::thread::spawn(move || {
                    while rt.status(me) != Some(TaskStatus::Waiting) {
                        std::thread::yield_now();
                    }
                    rt.ready(me);
                    tx.send(()).unwrap();
                })
            };
            gsched::park("external");
            gsched::blocking(move || waker.join().unwrap());
        }
    });
    assert_eq!(code, Ok(0));
}

#[test]
fn semaphore_hands_off_between_tasks() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(3).build();
    let served = Arc::new(AtomicUsize::new(0));
    let code = rt.run_main({
        let served = served.clone();
        move |_| {
            let requests = Arc::new(Semaphore::new(0));
            let done = Arc::new(Semaphore::new(0));
            for _ in 0..5 {
                let requests = requests.clone();
                let done = done.clone();
                let served = served.clone();
                gsched::spawn(move |_| {
                    requests.acquire();
                    served.fetch_add(1, Ordering::SeqCst);
                    done.release();
                });
            }
            for _ in 0..5 {
                requests.release();
            }
            for _ in 0..5 {
                done.acquire();
            }
        }
    });
    assert_eq!(code, Ok(0));
    assert_eq!(served.load(Ordering::SeqCst), 5);
}

#[test]
fn blocking_call_frees_its_slot() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    // One running slot: the sender can only run while the receiver sits in its blocking call.
    let rt = Arc::new(Runtime::builder().max_workers(1).build());
    let (tx, rx) = std::sync::mpsc::channel::<u32>();
    let receiver: Arc<Mutex<Option<TaskId>>> = Arc::default();
    let got = Arc::new(AtomicUsize::new(0));

    rt.spawn({
        let receiver = receiver.clone();
        let got = got.clone();
        move |_| {
            *receiver.lock() = gsched::current_task();
            let v = gsched::blocking(move || rx.recv().unwrap());
            got.store(v as usize, Ordering::SeqCst);
        }
    })
    .unwrap();

    rt.spawn({
        let rt = rt.clone();
        move |_| {
            let id = loop {
                if let Some(id) = *receiver.lock() {
                    break id;
                }
                gsched::yield_now();
            };
            while rt.status(id) != Some(TaskStatus::Syscall) {
                gsched::yield_now();
            }
            let bounds = rt.gc_stack_bounds(id).expect("blocking call records its stack");
            assert!(bounds.guard <= bounds.sp && bounds.sp <= bounds.base);
            tx.send(42).unwrap();
        }
    })
    .unwrap();

    assert_eq!(rt.run(), Ok(0));
    assert_eq!(got.load(Ordering::SeqCst), 42);
}

#[test]
fn set_max_workers_reports_previous() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Arc::new(Runtime::builder().max_workers(3).build());
    let code = rt.run_main({
        let rt = rt.clone();
        move |_| {
            assert_eq!(gsched::set_max_workers(0), 3);
            assert_eq!(gsched::set_max_workers(1), 3);
            assert_eq!(rt.stats().mcpu_max, 1);
            assert_eq!(gsched::set_max_workers(0), 1);
            assert_eq!(gsched::set_max_workers(2), 1);
            assert_eq!(rt.stats().mcpu_max, 2);
        }
    });
    assert_eq!(code, Ok(0));
}

#[test]
fn lowering_the_limit_under_load() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(4).build();
    let started = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let prev = Arc::new(AtomicUsize::new(0));

    for i in 0..4 {
        let started = started.clone();
        let done = done.clone();
        let prev = prev.clone();
        rt.spawn(move |_| {
            started.fetch_add(1, Ordering::SeqCst);
            while started.load(Ordering::SeqCst) < 4 {
                gsched::yield_now();
            }
            if i == 0 {
                prev.store(gsched::set_max_workers(1), Ordering::SeqCst);
            }
            for _ in 0..10 {
                spin(Duration::from_micros(100));
                gsched::yield_now();
            }
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert_eq!(rt.run(), Ok(0));
    assert_eq!(prev.load(Ordering::SeqCst), 4);
    assert_eq!(done.load(Ordering::SeqCst), 4);
    let stats = rt.stats();
    assert_eq!(stats.max_workers, 1);
    assert!(stats.mcpu <= stats.mcpu_max, "{stats:?}");
}

#[test]
fn finished_tasks_are_recycled() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(1).build();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = ran.clone();
        rt.spawn(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert_eq!(rt.run(), Ok(0));
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    let stats = rt.stats();
    assert_eq!((stats.tasks, stats.free), (0, 3));
}

#[test]
fn spawning_after_exit_ends_the_spawner() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    struct Stopped(Arc<AtomicBool>);
    impl Drop for Stopped {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let rt = Runtime::builder().max_workers(2).build();
    let running = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let code = rt.run_main({
        let running = running.clone();
        let stopped = stopped.clone();
        move |_| {
            gsched::spawn({
                let running = running.clone();
                move |_| {
                let _stopped = Stopped(stopped);
                running.store(true, Ordering::SeqCst);
                loop {
                    spin(Duration::from_micros(50));
                    gsched::spawn(|_| {});
                }
                }
            });
            while !running.load(Ordering::SeqCst) {
                gsched::yield_now();
            }
        }
    });
    assert_eq!(code, Ok(0));

    // the spawner still runs on its worker until its next spawn
    let deadline = Instant::now() + Duration::from_secs(10);
    while !stopped.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "spawner never stopped");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(rt.spawn(|_| {}), Err(Error::Exited));
}

#[test]
fn locked_task_stays_on_its_worker() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(2).build();
    let seen: Arc<Mutex<Vec<WorkerId>>> = Arc::default();
    let code = rt.run_main({
        let seen = seen.clone();
        move |_| {
            // keep the other workers busy
            let stop = Arc::new(AtomicBool::new(false));
            for _ in 0..3 {
                let stop = stop.clone();
                gsched::spawn(move |_| {
                    while !stop.load(Ordering::SeqCst) {
                        gsched::yield_now();
                    }
                });
            }

            let done = Arc::new(Semaphore::new(0));
            gsched::spawn({
                let seen = seen.clone();
                let done = done.clone();
                move |_| {
                    gsched::lock_os_thread();
                    assert!(gsched::locked_os_thread());
                    for _ in 0..20 {
                        seen.lock().push(gsched::worker_id().unwrap());
                        gsched::yield_now();
                    }
                    gsched::unlock_os_thread();
                    assert!(!gsched::locked_os_thread());
                    done.release();
                }
            });
            done.acquire();
            stop.store(true, Ordering::SeqCst);
        }
    });
    assert_eq!(code, Ok(0));

    let seen = seen.lock();
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().all(|w| *w == seen[0]), "locked task migrated: {seen:?}");
}

#[test]
fn main_runs_on_the_bootstrap_worker_when_init_locks() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let rt = Runtime::builder().max_workers(2).build();
    let code = rt.run_main_with_init(
        |_| gsched::lock_os_thread(),
        |_| {
            for _ in 0..5 {
                assert_eq!(gsched::worker_id(), Some(WorkerId::BOOTSTRAP));
                gsched::yield_now();
            }
        },
    );
    assert_eq!(code, Ok(0));
}

#[derive(Default)]
struct CountingCollector {
    helped: AtomicUsize,
    scavenged: AtomicUsize,
}

impl Collector for CountingCollector {
    fn gchelper(&self, _worker: WorkerId) {
        self.helped.fetch_add(1, Ordering::SeqCst);
    }

    fn scavenge(&self) {
        self.scavenged.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn stop_the_world_leaves_one_running() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let collector = Arc::new(CountingCollector::default());
    let rt = Arc::new(
        Runtime::builder()
            .max_workers(4)
            .collector(collector.clone())
            .build(),
    );

    let code = rt.run_main({
        let rt = rt.clone();
        let collector = collector.clone();
        move |_| {
            let stop = Arc::new(AtomicBool::new(false));
            let spinning = Arc::new(AtomicUsize::new(0));
            for _ in 0..3 {
                let stop = stop.clone();
                let spinning = spinning.clone();
                gsched::spawn(move |_| {
                    spinning.fetch_add(1, Ordering::SeqCst);
                    while !stop.load(Ordering::SeqCst) {
                        // call boundaries are where we notice the world stopping
                        let _ = gsched::call(0, &[], |_| std::hint::spin_loop());
                    }
                });
            }
            while spinning.load(Ordering::SeqCst) < 3 {
                gsched::yield_now();
            }

            gsched::stop_the_world();
            let stats = rt.stats();
            assert_eq!(stats.mcpu_max, 1);
            assert_eq!(stats.mcpu, 1);

            let (helpers, extra) = gsched::help_gc();
            assert!(helpers <= 3);
            gsched::start_the_world(extra);

            while collector.helped.load(Ordering::SeqCst) < helpers {
                gsched::yield_now();
            }
            assert_eq!(rt.stats().mcpu_max, 4);
            stop.store(true, Ordering::SeqCst);
        }
    });
    assert_eq!(code, Ok(0));
}

#[test]
fn maintenance_task_scavenges() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let collector = Arc::new(CountingCollector::default());
    let rt = Runtime::builder()
        .max_workers(2)
        .collector(collector.clone())
        .maintenance(Duration::from_millis(1))
        .build();

    let code = rt.run_main({
        let collector = collector.clone();
        move |_| {
            while collector.scavenged.load(Ordering::SeqCst) < 3 {
                gsched::blocking(|| std::thread::sleep(Duration::from_millis(1)));
            }
        }
    });
    assert_eq!(code, Ok(0));
    assert!(collector.scavenged.load(Ordering::SeqCst) >= 3);
}

#[test]
fn thread_start_hook_starts_workers() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let started: Arc<Mutex<Vec<String>>> = Arc::default();
    let rt = Runtime::builder()
        .max_workers(3)
        .thread_start({
            let started = started.clone();
            move |start| {
                started.lock().push(start.name().to_owned());
                std::thread::spawn(move || start.run());
            }
        })
        .build();

    for _ in 0..6 {
        rt.spawn(|_| spin(Duration::from_millis(1))).unwrap();
    }
    assert_eq!(rt.run(), Ok(0));

    let started = started.lock();
    assert!(!started.is_empty());
    assert_eq!(started.len() + 1, rt.mcount());
    assert!(started.iter().all(|name| name.starts_with("gsched-worker-")));
}

#[test]
fn cpu_profile_samples_call_sites() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default();

    let samples = Arc::new(AtomicUsize::new(0));
    let deepest = Arc::new(AtomicUsize::new(0));
    let rt = Runtime::builder().max_workers(1).build();

    let code = rt.run_main({
        let samples = samples.clone();
        let deepest = deepest.clone();
        move |_| {
            gsched::set_cpu_profile_rate(
                1000,
                Some(Arc::new(move |pcs: &[gsched::Pc]| {
                    samples.fetch_add(1, Ordering::SeqCst);
                    deepest.fetch_max(pcs.len(), Ordering::SeqCst);
                })),
            );
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(50) {
                let _ = gsched::call(0, &[], |_| {
                    let _ = gsched::call(0, &[], |_| spin(Duration::from_micros(50)));
                });
            }
            gsched::set_cpu_profile_rate(0, None);
        }
    });
    assert_eq!(code, Ok(0));
    assert!(samples.load(Ordering::SeqCst) > 0);
    assert!(deepest.load(Ordering::SeqCst) >= 2);
}
