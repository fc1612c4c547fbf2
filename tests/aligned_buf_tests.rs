//! Safe owned-buffer tests: accounting through construction, resize, drop.

use std::sync::Arc;

use quern_core::config::EngineConfig;
use quern_core::id::TaskId;
use quern_mem::{attach_task, AlignedBuf, Allocator, MemTracker, MemoryEnv, TaskState};

fn sync_config() -> EngineConfig {
    EngineConfig {
        sync_alloc_failure: true,
        wait_reclaim_max_ms: 200,
        large_alloc_backtrace_bytes: 0,
        ..EngineConfig::default()
    }
}

#[test]
fn construction_zero_fills_and_drop_releases() {
    let env = MemoryEnv::new(sync_config());
    let alloc = Allocator::heap(Arc::clone(&env));
    let task = TaskState::new(TaskId::new(30));
    let tracker = Arc::new(MemTracker::limited("buf30", 100_000));
    let _guard = attach_task(&task, &tracker);

    {
        let buf = AlignedBuf::new_zeroed(&alloc, 4_096, 64).unwrap();
        assert_eq!(buf.len(), 4_096);
        assert_eq!(buf.alignment(), 64);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(tracker.consumption(), 4_096);
    }
    assert_eq!(tracker.consumption(), 0);
    assert_eq!(env.arbitrator().consumption(), 0);
}

#[test]
fn resize_preserves_prefix_and_zeroes_growth() {
    let env = MemoryEnv::new(sync_config());
    let alloc = Allocator::heap(env);

    let mut buf = AlignedBuf::new_zeroed(&alloc, 16, 8).unwrap();
    buf.as_mut_slice().fill(0xAB);

    buf.resize(64).unwrap();
    assert!(buf[..16].iter().all(|&b| b == 0xAB));
    assert!(buf[16..].iter().all(|&b| b == 0));

    buf.resize(8).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAB));
}

#[test]
fn growth_respects_the_tracker_limit() {
    let env = MemoryEnv::new(sync_config());
    let alloc = Allocator::heap(env);
    let task = TaskState::new(TaskId::new(31));
    let tracker = Arc::new(MemTracker::limited("buf31", 1_000));
    let _guard = attach_task(&task, &tracker);

    let mut buf = AlignedBuf::new_zeroed(&alloc, 600, 8).unwrap();
    buf.as_mut_slice().fill(7);

    let denied = buf.resize(1_100);
    assert!(denied.is_err(), "600 -> 1100 exceeds the tracker limit");
    assert_eq!(buf.len(), 600, "the buffer survives a refused resize");
    assert!(buf.iter().all(|&b| b == 7));
    assert_eq!(tracker.consumption(), 600);

    buf.resize(900).unwrap();
    assert_eq!(tracker.consumption(), 900);
    drop(buf);
    assert_eq!(tracker.consumption(), 0);
}

#[test]
fn shrinking_is_exempt_from_admission() {
    let cfg = EngineConfig {
        hard_limit_bytes: 1_000,
        ..sync_config()
    };
    let env = MemoryEnv::new(cfg);
    let alloc = Allocator::heap(Arc::clone(&env));
    let task = TaskState::new(TaskId::new(32));
    let tracker = Arc::new(MemTracker::unlimited("buf32"));
    let _guard = attach_task(&task, &tracker);

    let mut buf = AlignedBuf::new_zeroed(&alloc, 1_000, 8).unwrap();
    assert!(alloc.allocate(1, 8).is_err(), "the process is saturated");

    buf.resize(500).unwrap();
    assert_eq!(env.arbitrator().consumption(), 500);
}

#[test]
fn empty_buffers_are_valid() {
    let env = MemoryEnv::new(sync_config());
    let alloc = Allocator::heap(env);

    let mut buf = AlignedBuf::new_zeroed(&alloc, 0, 16).unwrap();
    assert!(buf.is_empty());
    assert_eq!(buf.as_slice(), &[] as &[u8]);

    buf.resize(32).unwrap();
    assert_eq!(buf.len(), 32);
    assert!(buf.iter().all(|&b| b == 0));
}
