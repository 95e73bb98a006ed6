//! The two-entry callback invoked by instrumented code.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use crate::config::{MethodId, TraceConfig};
use crate::manager::CallTreeManager;
use crate::tracepoint::{ArgValue, Tracepoint};

/// A small trait for the hook's two operations, so tests can substitute a
/// fake without going through the process-wide global hook.
pub trait Hook: Send + Sync {
    fn enter(&self, method_id: MethodId, args: Option<Vec<ArgValue>>);
    fn leave(&self);
}

/// Looks up the tracepoint for `method_id`, optionally stamps it with
/// captured argument values, and dispatches to the [`CallTreeManager`].
///
/// Must be callable from arbitrary threads concurrently, must never throw
/// out of the hook, and allocates nothing beyond the unavoidable
/// arg-stamped wrapper.
pub struct TracerHook {
    config: Arc<TraceConfig>,
    manager: Arc<CallTreeManager>,
}

impl TracerHook {
    pub fn new(config: Arc<TraceConfig>, manager: Arc<CallTreeManager>) -> Self {
        TracerHook { config, manager }
    }
}

impl Hook for TracerHook {
    fn enter(&self, method_id: MethodId, args: Option<Vec<ArgValue>>) {
        // An invariant violation deep in the builder must never unwind
        // into instrumented code. `push`/`pop` panic rather
        // than silently repairing a corrupted tree, so catch that here,
        // log it, and treat it the same as any other swallowed hook error.
        let result = catch_unwind(AssertUnwindSafe(|| {
            let tracepoint = self.config.get_method_tracepoint(method_id);
            let effective = match args {
                Some(args) if !args.is_empty() => Tracepoint::MethodWithArgs(tracepoint, args),
                _ => Tracepoint::Method(tracepoint),
            };
            self.manager.enter(effective);
        }));
        if let Err(panic) = result {
            log_hook_panic("enter", panic);
        }
    }

    fn leave(&self) {
        let result = catch_unwind(AssertUnwindSafe(|| self.manager.leave()));
        if let Err(panic) = result {
            log_hook_panic("leave", panic);
        }
    }
}

fn log_hook_panic(op: &str, panic: Box<dyn std::any::Any + Send>) {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(op, message, "call tree invariant violation swallowed at hook boundary");
}

/// Process-wide hook instance, installed once. Instrumented bytecode calls
/// the free functions below via a static call site; there is no teardown.
static GLOBAL_HOOK: OnceLock<Arc<dyn Hook>> = OnceLock::new();

/// Installs the process-wide hook. Returns `false` (without replacing the
/// existing hook) if one was already installed.
pub fn install_global_hook(hook: Arc<dyn Hook>) -> bool {
    GLOBAL_HOOK.set(hook).is_ok()
}

/// Entry point for instrumented bytecode. No-ops if no hook has been
/// installed yet (e.g. the host runtime's instrumentation facility failed
/// to initialize).
pub fn enter(method_id: MethodId, args: Option<Vec<ArgValue>>) {
    if let Some(hook) = GLOBAL_HOOK.get() {
        hook.enter(method_id, args);
    }
}

pub fn leave() {
    if let Some(hook) = GLOBAL_HOOK.get() {
        hook.leave();
    }
}
