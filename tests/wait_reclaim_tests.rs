//! Wait-for-reclaim behavior under process memory pressure.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quern_core::config::EngineConfig;
use quern_core::id::TaskId;
use quern_mem::{attach_task, Allocator, MemTracker, MemoryArbitrator, MemoryEnv, TaskState};

fn pressure_config(hard_limit: i64, wait_ms: u64, sync_failure: bool) -> EngineConfig {
    EngineConfig {
        hard_limit_bytes: hard_limit,
        wait_reclaim_max_ms: wait_ms,
        sync_alloc_failure: sync_failure,
        large_alloc_backtrace_bytes: 0,
        ..EngineConfig::default()
    }
}

#[test]
fn wait_succeeds_once_memory_clears() {
    let arbitrator = Arc::new(MemoryArbitrator::new(1_000));
    let env = MemoryEnv::with_arbitrator(pressure_config(1_000, 2_000, true), Arc::clone(&arbitrator));
    let alloc = Allocator::heap(env);
    let task = TaskState::new(TaskId::new(1));
    let tracker = Arc::new(MemTracker::unlimited("waiter"));
    let _guard = attach_task(&task, &tracker);

    // Another consumer holds most of the process budget, then lets go.
    arbitrator.consume(900);
    let releaser = {
        let arbitrator = Arc::clone(&arbitrator);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(250));
            arbitrator.release(900);
        })
    };

    let start = Instant::now();
    let ptr = alloc.allocate(500, 8).expect("pressure clears within the wait budget");
    let elapsed = start.elapsed();
    releaser.join().unwrap();

    assert!(elapsed >= Duration::from_millis(200), "returned before the poll could observe the release: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "kept waiting after the release: {elapsed:?}");
    assert_eq!(arbitrator.reclaimed_by_wait(), 500);
    assert_eq!(tracker.consumption(), 500);
    assert!(task.wait_reclaim_enabled(), "a successful wait does not burn the one-per-lifetime budget");

    unsafe { alloc.deallocate(ptr, 500, 8) };
    assert_eq!(arbitrator.consumption(), 0);
}

#[test]
fn exhausted_wait_fails_and_disables_future_waits() {
    let env = MemoryEnv::new(pressure_config(0, 300, true));
    let alloc = Allocator::heap(env);
    let task = TaskState::new(TaskId::new(2));
    let tracker = Arc::new(MemTracker::unlimited("q2"));
    let _guard = attach_task(&task, &tracker);

    let start = Instant::now();
    let denied = alloc.allocate(100, 8);
    assert!(denied.is_err());
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(!task.wait_reclaim_enabled());

    // The second attempt must not stall again.
    let start = Instant::now();
    let denied = alloc.allocate(100, 8);
    assert!(denied.is_err());
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn exhausted_wait_cancels_task_in_async_mode() {
    let env = MemoryEnv::new(pressure_config(0, 300, false));
    let alloc = Allocator::heap(env);
    let task = TaskState::new(TaskId::new(3));
    let tracker = Arc::new(MemTracker::unlimited("q3"));
    let _guard = attach_task(&task, &tracker);

    let start = Instant::now();
    let ptr = alloc.allocate(100, 8).expect("async mode reports success and cancels");
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(task.is_cancelled());
    assert!(task
        .cancel_reason()
        .expect("diagnostic recorded on the task")
        .contains("hard limit admission failed"));
    assert!(!task.wait_reclaim_enabled());

    unsafe { alloc.deallocate(ptr, 100, 8) };
}

#[test]
fn cancellation_during_the_wait_aborts_promptly() {
    let env = MemoryEnv::new(pressure_config(0, 10_000, true));
    let alloc = Allocator::heap(env);
    let task = TaskState::new(TaskId::new(4));
    let tracker = Arc::new(MemTracker::unlimited("q4"));
    let _guard = attach_task(&task, &tracker);

    let canceller = {
        let task = Arc::clone(&task);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            task.cancel("cancelled by the pressure driver");
        })
    };

    let start = Instant::now();
    let denied = alloc.allocate(100, 8);
    let elapsed = start.elapsed();
    canceller.join().unwrap();

    assert!(denied.is_err());
    assert!(elapsed >= Duration::from_millis(150));
    assert!(
        elapsed < Duration::from_secs(2),
        "the wait must abort on cancellation, not run to its timeout: {elapsed:?}"
    );
}

#[test]
fn globally_disabled_waiting_skips_the_loop_and_proceeds() {
    let cfg = EngineConfig {
        disable_wait_reclaim: true,
        ..pressure_config(0, 1_000, true)
    };
    let env = MemoryEnv::new(cfg);
    let alloc = Allocator::heap(env);
    let task = TaskState::new(TaskId::new(5));
    let tracker = Arc::new(MemTracker::unlimited("q5"));
    let _guard = attach_task(&task, &tracker);

    let start = Instant::now();
    // With the loop disabled the eligible task is let through as if memory
    // had cleared; per-task limits remain the backstop.
    let ptr = alloc.allocate(100, 8).expect("degrade mode lets the task proceed");
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(task.wait_reclaim_enabled());
    assert!(!task.is_cancelled());

    unsafe { alloc.deallocate(ptr, 100, 8) };
}
