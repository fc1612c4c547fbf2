//! Thread-scoped accounting context.
//!
//! Each worker thread carries the task it currently executes for, the
//! tracker that charges for its allocations, and a reentrancy counter that
//! lets the accounting machinery bypass its own checks. Attachment is
//! scoped: guards restore the previous state on drop, on every exit path.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use quern_core::id::TaskId;

use crate::tracker::MemTracker;

/// Shared, cancellable state for one executing task.
///
/// Cloned (via `Arc`) into every thread working on the task, and into any
/// driver that may cancel it from outside.
#[derive(Debug)]
pub struct TaskState {
    id: TaskId,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    wait_reclaim_enabled: AtomicBool,
}

impl TaskState {
    pub fn new(id: TaskId) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
            wait_reclaim_enabled: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Re-read on every check and wait iteration; may be set by any thread.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the task cancelled. The first reason wins; later calls only set
    /// the flag again.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.cancel_reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::warn!(task = %self.id, %reason, "task cancelled");
        }
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().unwrap().clone()
    }

    pub fn wait_reclaim_enabled(&self) -> bool {
        self.wait_reclaim_enabled.load(Ordering::Acquire)
    }

    /// A task gets one full wait-for-reclaim in its lifetime; this turns
    /// future waits off permanently.
    pub fn disable_wait_reclaim(&self) {
        self.wait_reclaim_enabled.store(false, Ordering::Release);
    }
}

struct ThreadCtx {
    task: RefCell<Option<Arc<TaskState>>>,
    tracker: RefCell<Arc<MemTracker>>,
    skip_check_depth: Cell<u32>,
    last_consumer_label: RefCell<String>,
}

thread_local! {
    static CTX: ThreadCtx = ThreadCtx {
        task: RefCell::new(None),
        // Unattached threads account against an unlimited orphan scope.
        tracker: RefCell::new(Arc::new(MemTracker::unlimited("orphan"))),
        skip_check_depth: Cell::new(0),
        last_consumer_label: RefCell::new(String::new()),
    };
}

/// Attach the current thread to `task`, charging `tracker` for its
/// allocations until the guard drops.
#[must_use = "detaches immediately if dropped"]
pub fn attach_task(task: &Arc<TaskState>, tracker: &Arc<MemTracker>) -> AttachGuard {
    CTX.with(|c| {
        let prev_task = c.task.replace(Some(Arc::clone(task)));
        let prev_tracker = c.tracker.replace(Arc::clone(tracker));
        AttachGuard {
            prev_task,
            prev_tracker: Some(prev_tracker),
            _not_send: PhantomData,
        }
    })
}

/// Restores the previously attached task/tracker on drop.
pub struct AttachGuard {
    prev_task: Option<Arc<TaskState>>,
    prev_tracker: Option<Arc<MemTracker>>,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        CTX.with(|c| {
            *c.task.borrow_mut() = self.prev_task.take();
            if let Some(prev) = self.prev_tracker.take() {
                *c.tracker.borrow_mut() = prev;
            }
        });
    }
}

pub fn is_attached() -> bool {
    CTX.with(|c| c.task.borrow().is_some())
}

pub fn attached_task() -> Option<Arc<TaskState>> {
    CTX.with(|c| c.task.borrow().clone())
}

pub fn attached_task_id() -> Option<TaskId> {
    CTX.with(|c| c.task.borrow().as_ref().map(|t| t.id()))
}

/// The tracker charged for this thread's allocations.
pub fn tracker() -> Arc<MemTracker> {
    CTX.with(|c| Arc::clone(&c.tracker.borrow()))
}

/// Label of the tracker that most recently consumed on this thread.
pub fn last_consumer_label() -> String {
    CTX.with(|c| c.last_consumer_label.borrow().clone())
}

pub(crate) fn set_last_consumer_label(label: &str) {
    CTX.with(|c| {
        let mut slot = c.last_consumer_label.borrow_mut();
        if *slot != label {
            slot.clear();
            slot.push_str(label);
        }
    });
}

/// True while any [`SkipCheckGuard`] is alive on this thread.
pub fn skip_checks_active() -> bool {
    CTX.with(|c| c.skip_check_depth.get() > 0)
}

/// Suspends limit checks on this thread for the guard's lifetime, so the
/// accounting machinery's own bookkeeping cannot recurse into the checks.
/// The depth is restored on drop, including on unwind.
#[must_use = "checks resume immediately if dropped"]
pub struct SkipCheckGuard {
    _not_send: PhantomData<*mut ()>,
}

impl SkipCheckGuard {
    pub fn new() -> Self {
        CTX.with(|c| c.skip_check_depth.set(c.skip_check_depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for SkipCheckGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SkipCheckGuard {
    fn drop(&mut self) {
        CTX.with(|c| c.skip_check_depth.set(c.skip_check_depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_guard_restores_previous_state() {
        assert!(!is_attached());
        let task = TaskState::new(TaskId::new(7));
        let tracker = Arc::new(MemTracker::limited("q7", 1_000));
        {
            let _guard = attach_task(&task, &tracker);
            assert!(is_attached());
            assert_eq!(attached_task_id(), Some(TaskId::new(7)));
            assert_eq!(super::tracker().label(), "q7");
        }
        assert!(!is_attached());
        assert_eq!(super::tracker().label(), "orphan");
    }

    #[test]
    fn nested_attachment_unwinds_in_order() {
        let outer = TaskState::new(TaskId::new(1));
        let inner = TaskState::new(TaskId::new(2));
        let t1 = Arc::new(MemTracker::unlimited("outer"));
        let t2 = Arc::new(MemTracker::unlimited("inner"));
        let _g1 = attach_task(&outer, &t1);
        {
            let _g2 = attach_task(&inner, &t2);
            assert_eq!(attached_task_id(), Some(TaskId::new(2)));
        }
        assert_eq!(attached_task_id(), Some(TaskId::new(1)));
    }

    #[test]
    fn skip_guard_depth_survives_panic() {
        assert!(!skip_checks_active());
        let result = std::panic::catch_unwind(|| {
            let _guard = SkipCheckGuard::new();
            assert!(skip_checks_active());
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!skip_checks_active());
    }

    #[test]
    fn cancellation_keeps_first_reason() {
        let task = TaskState::new(TaskId::new(3));
        assert!(!task.is_cancelled());
        task.cancel("first");
        task.cancel("second");
        assert!(task.is_cancelled());
        assert_eq!(task.cancel_reason().as_deref(), Some("first"));
    }
}
