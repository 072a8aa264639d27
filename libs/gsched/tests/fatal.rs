// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fatal errors end the process, so every case runs in a child process: the test binary
//! re-executes itself running only `child`, which picks the case from the environment.

use core::fmt;
use gsched::{EXIT_PANIC, EXIT_PANIC_DURING_PANIC, PanicValue, Runtime, TaskStatus};
use std::process::{Command, Output};
use std::sync::Arc;

const CASE_VAR: &str = "GSCHED_FATAL_CASE";

struct Explodes;

impl fmt::Debug for Explodes {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        panic!("cannot describe myself")
    }
}

fn rt() -> Runtime {
    Runtime::builder().max_workers(2).traceback(1).build()
}

#[test]
fn child() {
    let Ok(case) = std::env::var(CASE_VAR) else {
        return;
    };
    let _ = match case.as_str() {
        "panic" => rt().run_main(|_| gsched::panic("boom")),
        "recovered_then_panic" => rt().run_main(|_| {
            let _ = gsched::call(0, &[], |f| {
                f.defer(|d| {
                    let _ = d.recover();
                    gsched::panic("second");
                });
                gsched::panic("first");
            });
        }),
        "nested_panic" => rt().run_main(|_| {
            let _ = gsched::call(0, &[], |f| {
                f.defer(|_| gsched::panic("second"));
                gsched::panic("first");
            });
        }),
        "ready_dead" => {
            let rt = Arc::new(rt());
            let handle = rt.clone();
            rt.run_main(move |_| {
                let id = gsched::spawn(|_| {});
                while handle.status(id) != Some(TaskStatus::Dead) {
                    gsched::yield_now();
                }
                handle.ready(id);
            })
        }
        "deadlock" => rt().run_main(|_| gsched::park("forever")),
        "deadlock_with_maintenance" => Runtime::builder()
            .max_workers(2)
            .maintenance(std::time::Duration::from_secs(60))
            .build()
            .run_main(|_| gsched::park("forever")),
        "panic_during_panic" => rt().run_main(|_| gsched::panic(PanicValue::new(Explodes))),
        "double_idle" => rt().run_main(|_| {
            gsched::idle_goroutine();
            gsched::idle_goroutine();
        }),
        "args_too_large" => rt().run_main(|_| {
            gsched::spawn_raw(|_| {}, &[0; 4096]);
        }),
        "quiet" => Runtime::builder()
            .max_workers(1)
            .traceback(0)
            .build()
            .run_main(|_| gsched::panic("boom")),
        "outside" => gsched::panic("no task"),
        "many_tasks" => rt().run_main(|_| {
            for _ in 0..3 {
                gsched::spawn(|_| gsched::park("sleepy"));
            }
            gsched::yield_now();
            gsched::panic("main gives up");
        }),
        other => panic!("unknown case {other}"),
    };
    unreachable!("case {case} did not die");
}

fn run_case(case: &str) -> (Option<i32>, String) {
    let exe = std::env::current_exe().unwrap();
    let Output { status, stderr, .. } = Command::new(exe)
        .args(["--exact", "child", "--nocapture", "--test-threads=1"])
        .env(CASE_VAR, case)
        .env_remove("GSCHED_TRACEBACK")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();
    (status.code(), stderr)
}

#[test]
fn unrecovered_panic() {
    let (code, stderr) = run_case("panic");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(stderr.contains("panic: boom\n"), "{stderr}");
    assert_eq!(stderr.matches("panic: ").count(), 1, "{stderr}");
    assert!(stderr.contains("goroutine 1 [running]:"), "{stderr}");
}

#[test]
fn panic_in_deferred_call_extends_the_chain() {
    let (code, stderr) = run_case("nested_panic");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(stderr.contains("panic: first\n\tpanic: second\n"), "{stderr}");
    assert!(!stderr.contains("[recovered]"), "{stderr}");
}

#[test]
fn ready_of_a_finished_task() {
    let (code, stderr) = run_case("ready_dead");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(stderr.contains("throw: bad g->status in ready"), "{stderr}");
    assert!(stderr.contains(" is dead\n"), "{stderr}");
}

#[test]
fn panic_chain_marks_recovered_panics() {
    let (code, stderr) = run_case("recovered_then_panic");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(
        stderr.contains("panic: first [recovered]\n\tpanic: second\n"),
        "{stderr}"
    );
}

#[test]
fn deadlock_is_detected() {
    let (code, stderr) = run_case("deadlock");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(
        stderr.contains("throw: all goroutines are asleep - deadlock!"),
        "{stderr}"
    );
    assert!(stderr.contains("goroutine 1 [forever]:"), "{stderr}");
}

#[test]
fn deadlock_is_detected_despite_the_maintenance_task() {
    let (code, stderr) = run_case("deadlock_with_maintenance");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(
        stderr.contains("throw: all goroutines are asleep - deadlock!"),
        "{stderr}"
    );
}

#[test]
fn panic_while_reporting_a_panic() {
    let (code, stderr) = run_case("panic_during_panic");
    assert_eq!(code, Some(EXIT_PANIC_DURING_PANIC), "{stderr}");
    assert!(stderr.contains("panic during panic"), "{stderr}");
}

#[test]
fn idle_goroutine_twice() {
    let (code, stderr) = run_case("double_idle");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(
        stderr.contains("throw: g is already an idle goroutine"),
        "{stderr}"
    );
}

#[test]
fn spawn_arguments_too_large() {
    let (code, stderr) = run_case("args_too_large");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(
        stderr.contains("throw: newproc: function arguments too large for new task"),
        "{stderr}"
    );
}

#[test]
fn traceback_level_zero_only_prints_the_panic() {
    let (code, stderr) = run_case("quiet");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(stderr.contains("panic: boom"), "{stderr}");
    assert!(!stderr.contains("goroutine "), "{stderr}");
}

#[test]
fn panic_outside_of_a_task() {
    let (code, stderr) = run_case("outside");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(stderr.contains("panic: no task"), "{stderr}");
}

#[test]
fn other_tasks_are_listed() {
    let (code, stderr) = run_case("many_tasks");
    assert_eq!(code, Some(EXIT_PANIC), "{stderr}");
    assert!(stderr.contains("panic: main gives up"), "{stderr}");
    // each one is listed, whether it got to park yet or not
    assert_eq!(stderr.matches("created by ").count(), 3, "{stderr}");
}
