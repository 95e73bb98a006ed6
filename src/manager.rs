//! Owns per-thread call-tree builders, enforces hook non-reentrancy, and
//! produces merged snapshots.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;

use quanta::Clock;

use crate::call_tree::{CallTree, CallTreeBuilder};
use crate::fqname::MethodFqName;
use crate::id_list::IdList;
use crate::tracepoint::{MethodTracepoint, Tracepoint};

struct ThreadLocalState {
    busy: bool,
    builder: Option<Arc<Mutex<CallTreeBuilder>>>,
}

impl Default for ThreadLocalState {
    fn default() -> Self {
        ThreadLocalState {
            busy: false,
            builder: None,
        }
    }
}

thread_local! {
    static LOCAL: RefCell<ThreadLocalState> = RefCell::new(ThreadLocalState::default());
}

/// Owns every thread's [`CallTreeBuilder`], created lazily on first hook
/// call on that thread and kept for the process lifetime -- there is no
/// cross-thread GC of dead threads' builders.
pub struct CallTreeManager {
    clock: Clock,
    max_call_depth: usize,
    builders: IdList<Mutex<CallTreeBuilder>>,
}

/// Configure & build a [`CallTreeManager`].
pub struct CallTreeManagerBuilder {
    clock: Option<Clock>,
    max_call_depth: usize,
}

impl Default for CallTreeManagerBuilder {
    fn default() -> Self {
        CallTreeManagerBuilder {
            clock: None,
            max_call_depth: 512,
        }
    }
}

impl CallTreeManagerBuilder {
    /// The clock to use for measuring execution time. Defaults to a real
    /// clock; inject a mock one (`quanta::Clock::mock()`) for tests.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Call paths below this depth are capped: their execution is still
    /// counted against the deepest kept ancestor, as if inlined, rather
    /// than growing the tree without bound.
    pub fn max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn build(self) -> CallTreeManager {
        let manager = CallTreeManager {
            clock: self.clock.unwrap_or_else(Clock::new),
            max_call_depth: self.max_call_depth.max(2),
            builders: IdList::new(),
        };
        manager.warm_up();
        manager
    }
}

impl CallTreeManager {
    pub fn builder() -> CallTreeManagerBuilder {
        CallTreeManagerBuilder::default()
    }

    /// Exercises the allocation paths `enter`/`leave` depend on (the
    /// per-thread registry, the builder's tree arena) once, up front, on a
    /// throwaway builder that is never registered -- so that if any of
    /// those container types are themselves instrumented, the real
    /// `enter`/`leave` calls on hot threads never pay for their first-use
    /// allocation inside the busy-flag-guarded critical section.
    fn warm_up(&self) {
        let mut scratch = CallTreeBuilder::new(self.clock.clone(), self.max_call_depth);
        let warmup_tp = Tracepoint::Method(Arc::new(MethodTracepoint::new(MethodFqName::new(
            "<warmup>",
            "<warmup>",
            "()V",
        ))));
        scratch.push(warmup_tp);
        scratch.pop();
    }

    fn register_new_builder(&self) -> Arc<Mutex<CallTreeBuilder>> {
        let builder = Mutex::new(CallTreeBuilder::new(self.clock.clone(), self.max_call_depth));
        let idx = self.builders.append(builder);
        self.builders.get(idx)
    }

    /// Locks `builder`, refunding any time spent waiting for the lock back
    /// into the builder's clock so that brief contention with a snapshot
    /// reader never inflates a traced method's wall time.
    fn lock_with_overhead_refund(
        builder: &Arc<Mutex<CallTreeBuilder>>,
    ) -> std::sync::MutexGuard<'_, CallTreeBuilder> {
        match builder.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                let wait_start = Instant::now();
                let mut guard = match builder.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => {
                        tracing::error!("call tree builder mutex poisoned; recovering");
                        poisoned.into_inner()
                    }
                };
                guard.subtract_overhead(wait_start.elapsed());
                guard
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                tracing::error!("call tree builder mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Pushes `tracepoint` onto the calling thread's call tree. No-ops if
    /// this thread is already inside a hook call -- the busy flag is held
    /// only for the duration of this call, not for the traced method's
    /// whole body.
    pub fn enter(&self, tracepoint: Tracepoint) {
        let builder = LOCAL.with(|state| {
            let mut state = state.borrow_mut();
            if state.busy {
                return None;
            }
            state.busy = true;
            if state.builder.is_none() {
                state.builder = Some(self.register_new_builder());
            }
            state.builder.clone()
        });

        let Some(builder) = builder else { return };

        {
            let mut guard = Self::lock_with_overhead_refund(&builder);
            guard.push(tracepoint);
        }

        LOCAL.with(|state| state.borrow_mut().busy = false);
    }

    /// Symmetric with [`CallTreeManager::enter`]: no-ops iff the paired
    /// `enter` no-opped, so a suppressed re-entrant enter/leave pair never
    /// unbalances the real call stack.
    pub fn leave(&self) {
        let builder = LOCAL.with(|state| {
            let mut state = state.borrow_mut();
            if state.busy {
                return None;
            }
            state.busy = true;
            state.builder.clone()
        });

        let Some(builder) = builder else { return };

        {
            let mut guard = Self::lock_with_overhead_refund(&builder);
            guard.pop();
        }

        LOCAL.with(|state| state.borrow_mut().busy = false);
    }

    /// Takes a snapshot of every thread's tree merged together. The result
    /// is independent of the live builders: later pushes/pops on any
    /// thread do not retroactively change it.
    pub fn snapshot_all_threads_merged(&self) -> CallTree {
        let mut merged = CallTree::default();
        for idx in 0..self.builders.len() {
            let builder = self.builders.get(idx);
            let mut guard = builder.lock().unwrap_or_else(|e| e.into_inner());
            let tree = guard.borrow_up_to_date_tree();
            merged.merge_whole_tree(tree);
        }
        merged
    }

    /// Resets every thread's tree to empty while preserving each thread's
    /// currently-open call stack. Not atomic across threads: a thread
    /// whose push/pop races with this may have its in-flight call
    /// partially cleared, which is accepted by design.
    pub fn clear_call_trees(&self) {
        for idx in 0..self.builders.len() {
            let builder = self.builders.get(idx);
            let mut guard = builder.lock().unwrap_or_else(|e| e.into_inner());
            guard.clear();
        }
    }
}
