//! The accounting allocation engine.
//!
//! Every allocation runs a two-phase admission check (process hard limit,
//! then the thread's tracker limit), may wait a bounded time for concurrent
//! reclamation when the process is at its limit, and then charges the
//! tracker and arbitrator before touching the raw source. Failure is
//! signaled either synchronously to the caller or by asynchronously
//! cancelling the owning task, selected once per process via
//! [`EngineConfig::sync_alloc_failure`].

use std::alloc::Layout;
use std::backtrace::Backtrace;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::distributions::{Bernoulli, Distribution};

use quern_core::config::EngineConfig;

use crate::arbitrator::MemoryArbitrator;
use crate::context::{self, SkipCheckGuard};
use crate::error::{Error, Result};
use crate::source::{HeapMemory, MappedMemory, RawMemory, RecordingMemory};

/// Poll step for the wait-for-reclaim loop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process-wide pieces the engine consults on every call: configuration,
/// the arbitrator, and a readiness flag that bypasses all checks during
/// startup (and lets tests exercise the unchecked path).
#[derive(Debug)]
pub struct MemoryEnv {
    config: EngineConfig,
    arbitrator: Arc<MemoryArbitrator>,
    ready: AtomicBool,
}

impl MemoryEnv {
    /// Build an environment with its own arbitrator sized from the config.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let arbitrator = Arc::new(MemoryArbitrator::new(config.hard_limit_bytes));
        Self::with_arbitrator(config, arbitrator)
    }

    /// Build an environment around an externally owned arbitrator.
    pub fn with_arbitrator(config: EngineConfig, arbitrator: Arc<MemoryArbitrator>) -> Arc<Self> {
        Arc::new(Self {
            config,
            arbitrator,
            ready: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn arbitrator(&self) -> &MemoryArbitrator {
        &self.arbitrator
    }

    /// Checks run only once the environment is ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

/// Memory-accounting allocator over a raw source strategy.
///
/// Cheap to clone; clones share the environment. The source strategy and
/// the zero-fill behavior are fixed at construction, not per call.
#[derive(Debug, Clone)]
pub struct Allocator<M: RawMemory = HeapMemory> {
    env: Arc<MemoryEnv>,
    source: M,
    clear_memory: bool,
}

impl Allocator<HeapMemory> {
    pub fn heap(env: Arc<MemoryEnv>) -> Self {
        Self::new(env, HeapMemory)
    }
}

impl Allocator<MappedMemory> {
    pub fn mapped(env: Arc<MemoryEnv>) -> Self {
        Self::new(env, MappedMemory)
    }
}

impl Allocator<RecordingMemory> {
    pub fn recording(env: Arc<MemoryEnv>) -> Self {
        Self::new(env, RecordingMemory)
    }
}

impl<M: RawMemory> Allocator<M> {
    pub fn new(env: Arc<MemoryEnv>, source: M) -> Self {
        Self {
            env,
            source,
            clear_memory: false,
        }
    }

    /// Request zero-filled memory from every allocation.
    pub fn clear_memory(mut self, clear: bool) -> Self {
        self.clear_memory = clear;
        self
    }

    pub fn clears_memory(&self) -> bool {
        self.clear_memory
    }

    pub fn env(&self) -> &Arc<MemoryEnv> {
        &self.env
    }

    /// Obtain `size` bytes aligned to `alignment`.
    ///
    /// Runs both admission checks, charges the accounting, then delegates to
    /// the raw source. A `Ok` return is never null; failure arrives as
    /// [`Error::AllocFailed`] (or, in asynchronous-cancellation mode, as a
    /// cancelled task with the call itself succeeding).
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, alignment).map_err(|e| {
            Error::AllocFailed(format!(
                "invalid layout: size {size}, alignment {alignment}: {e}"
            ))
        })?;
        self.memory_check(size as i64)?;
        self.consume_memory(size as i64);
        match self
            .source
            .allocate(layout, self.clear_memory, self.env.config.mmap_populate)
        {
            Ok(ptr) => {
                self.add_address_sanitizer(ptr, size);
                Ok(ptr)
            }
            Err(e) => {
                // The checks already passed; a refusal from the raw source
                // is not retried.
                self.release_memory(size as i64);
                self.env.arbitrator.log_process_usage();
                Err(e)
            }
        }
    }

    /// Resize a buffer; only growth is checked, shrinking never increases
    /// pressure. The returned pointer replaces `ptr` unconditionally.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate`/`reallocate` on this allocator with
    /// exactly `old_size`/`alignment`, and must not be used after this call.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>> {
        if old_size == new_size {
            return Ok(ptr);
        }
        let old_layout = Layout::from_size_align(old_size, alignment).map_err(|e| {
            Error::AllocFailed(format!(
                "invalid layout: size {old_size}, alignment {alignment}: {e}"
            ))
        })?;
        let new_layout = Layout::from_size_align(new_size, alignment).map_err(|e| {
            Error::AllocFailed(format!(
                "invalid layout: size {new_size}, alignment {alignment}: {e}"
            ))
        })?;
        if new_size > old_size {
            self.memory_check((new_size - old_size) as i64)?;
        }
        self.remove_address_sanitizer(ptr, old_size);
        // SAFETY: forwarded caller contract.
        let resized = unsafe {
            self.source.resize(
                ptr,
                old_layout,
                new_layout,
                self.clear_memory,
                self.env.config.mmap_populate,
            )
        };
        match resized {
            Ok(new_ptr) => {
                if new_size > old_size {
                    self.consume_memory((new_size - old_size) as i64);
                } else {
                    self.release_memory((old_size - new_size) as i64);
                }
                self.add_address_sanitizer(new_ptr, new_size);
                Ok(new_ptr)
            }
            Err(e) => {
                // The old buffer is still live; re-register it.
                self.add_address_sanitizer(ptr, old_size);
                Err(e)
            }
        }
    }

    /// Return a buffer and its accounted bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate`/`reallocate` on this allocator with
    /// exactly `size`/`alignment`, and must not be used after this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let Ok(layout) = Layout::from_size_align(size, alignment) else {
            tracing::error!(size, alignment, "deallocate called with an invalid layout");
            return;
        };
        self.remove_address_sanitizer(ptr, size);
        // SAFETY: forwarded caller contract.
        unsafe { self.source.free(ptr, layout) };
        self.release_memory(size as i64);
    }

    /// Both limits are independent; the tracker check runs even when the
    /// system check already let the request through.
    fn memory_check(&self, size: i64) -> Result<()> {
        self.sys_memory_check(size)?;
        self.memory_tracker_check(size)
    }

    /// Hard-limit admission against the process arbitrator, with fault
    /// injection and the bounded wait-for-reclaim.
    fn sys_memory_check(&self, size: i64) -> Result<()> {
        if !self.env.is_ready() || context::skip_checks_active() {
            return Ok(());
        }
        let cfg = &self.env.config;

        if cfg.alloc_fault_probability > 0.0 && self.draw_injected_fault() {
            let msg = match context::attached_task_id() {
                Some(id) => format!("injected fault: task {id} denied {size} bytes"),
                None => format!("injected fault: unattached thread denied {size} bytes"),
            };
            tracing::info!(size, "{msg}");
            if cfg.sync_alloc_failure {
                return Err(Error::AllocFailed(msg));
            }
            if let Some(task) = context::attached_task() {
                task.cancel(msg);
            }
            // Async mode falls through to the normal admission path.
        }

        if !self.env.arbitrator.would_exceed_hard_limit(size) {
            return Ok(());
        }

        let tracker = context::tracker();
        let mut err_msg = format!(
            "hard limit admission failed: cannot allocate {size} bytes, consuming tracker <{}> \
             peak {} current {}, last consumer <{}>, {}",
            tracker.label(),
            tracker.peak_consumption(),
            tracker.consumption(),
            context::last_consumer_label(),
            self.env.arbitrator.usage_summary(),
        );
        if cfg.large_alloc_backtrace_bytes > 0 && size > cfg.large_alloc_backtrace_bytes {
            err_msg.push_str(&format!(
                "\nallocation backtrace:\n{}",
                Backtrace::force_capture()
            ));
        }

        let task = context::attached_task();

        // A task cancelled elsewhere must not start a wait.
        if let Some(t) = &task {
            if t.is_cancelled() {
                if cfg.sync_alloc_failure {
                    return Err(Error::AllocFailed(err_msg));
                }
                return Ok(());
            }
        }

        match &task {
            Some(t) if t.wait_reclaim_enabled() => {
                tracing::info!(
                    task = %t.id(),
                    size,
                    max_ms = cfg.wait_reclaim_max_ms,
                    "waiting for memory to be reclaimed"
                );
                let mut waited_ms: u64 = 0;
                if !cfg.disable_wait_reclaim {
                    while waited_ms < cfg.wait_reclaim_max_ms {
                        thread::sleep(WAIT_POLL_INTERVAL);
                        if !self.env.arbitrator.would_exceed_hard_limit(size) {
                            self.env.arbitrator.record_reclaimed(size);
                            tracing::info!(
                                task = %t.id(),
                                size,
                                waited_ms,
                                "memory reclaimed while waiting"
                            );
                            break;
                        }
                        if t.is_cancelled() {
                            if cfg.sync_alloc_failure {
                                return Err(Error::AllocFailed(err_msg));
                            }
                            return Ok(());
                        }
                        waited_ms += WAIT_POLL_INTERVAL.as_millis() as u64;
                    }
                }
                if waited_ms >= cfg.wait_reclaim_max_ms {
                    // One full wait per task lifetime.
                    t.disable_wait_reclaim();
                    self.env.arbitrator.log_process_usage();
                    if cfg.sync_alloc_failure {
                        tracing::info!(
                            task = %t.id(),
                            waited_ms,
                            "allocation failed after waiting for memory"
                        );
                        return Err(Error::AllocFailed(err_msg));
                    }
                    tracing::info!(
                        task = %t.id(),
                        waited_ms,
                        "task cancelled asynchronously after waiting for memory"
                    );
                    t.cancel(err_msg);
                }
                // Memory cleared in time (or waiting is disabled); continue.
                Ok(())
            }
            _ => {
                if cfg.sync_alloc_failure {
                    self.env.arbitrator.log_process_usage();
                    tracing::info!(size, "hard limit admission failed, failing allocation");
                    Err(Error::AllocFailed(err_msg))
                } else {
                    // Unattached (or wait-exhausted) threads proceed past the
                    // hard limit; per-task limits and cancellation converge.
                    tracing::info!(size, "hard limit admission failed, proceeding anyway");
                    Ok(())
                }
            }
        }
    }

    /// Per-task tracker limit, independent of the process hard limit.
    /// Breaches never wait; they fail or cancel immediately.
    fn memory_tracker_check(&self, size: i64) -> Result<()> {
        if !self.env.is_ready() || context::skip_checks_active() {
            return Ok(());
        }
        let tracker = context::tracker();
        let exceeded = match tracker.check_limit(size) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let err_msg = format!("tracker limit check failed: {exceeded}");
        tracker.log_usage(&err_msg);
        let cfg = &self.env.config;
        if let Some(task) = context::attached_task() {
            task.disable_wait_reclaim();
            if cfg.sync_alloc_failure {
                tracing::info!(task = %task.id(), "allocation failed on tracker limit");
                return Err(Error::AllocFailed(err_msg));
            }
            tracing::info!(task = %task.id(), "task cancelled asynchronously on tracker limit");
            task.cancel(err_msg);
            return Ok(());
        }
        if cfg.sync_alloc_failure {
            Err(Error::AllocFailed(err_msg))
        } else {
            tracing::info!("tracker limit check failed, proceeding anyway");
            Ok(())
        }
    }

    /// Charge the thread's tracker and the arbitrator. The skip guard keeps
    /// this bookkeeping from re-entering the checks.
    fn consume_memory(&self, size: i64) {
        let _skip = SkipCheckGuard::new();
        let tracker = context::tracker();
        tracker.consume(size);
        context::set_last_consumer_label(tracker.label());
        self.env.arbitrator.consume(size);
    }

    /// The exact inverse of [`consume_memory`](Self::consume_memory).
    fn release_memory(&self, size: i64) {
        let _skip = SkipCheckGuard::new();
        context::tracker().release(size);
        self.env.arbitrator.release(size);
    }

    /// Register the region with the tracker's out-of-band instrumentation.
    pub fn add_address_sanitizer(&self, ptr: NonNull<u8>, size: usize) {
        if !self.env.is_ready() || context::skip_checks_active() {
            return;
        }
        context::tracker().add_region(ptr.as_ptr() as usize, size);
    }

    /// Unregister the region from the tracker's out-of-band instrumentation.
    pub fn remove_address_sanitizer(&self, ptr: NonNull<u8>, size: usize) {
        if !self.env.is_ready() || context::skip_checks_active() {
            return;
        }
        context::tracker().remove_region(ptr.as_ptr() as usize, size);
    }

    fn draw_injected_fault(&self) -> bool {
        let p = self.env.config.alloc_fault_probability.clamp(0.0, 1.0);
        match Bernoulli::new(p) {
            Ok(dist) => dist.sample(&mut rand::thread_rng()),
            Err(_) => false,
        }
    }
}
