//! External collaborators: the host runtime's instrumentation facility,
//! and the view. This crate only specifies the interfaces it consumes
//! and exposes; a concrete host application supplies real implementations
//! (real class loading, a real bytecode library, real UI widgets).

use std::sync::Arc;

use crate::error::HostError;

/// One method of a loaded class, as the host runtime reflects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub descriptor: String,
    pub param_count: usize,
    pub is_constructor: bool,
}

/// A class currently loaded in the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    pub fqcn: String,
    pub methods: Vec<MethodSignature>,
    /// Whether the host runtime will allow this class's bytecode to be
    /// rewritten. Non-modifiable classes are skipped with a warning, not a
    /// fatal error.
    pub modifiable: bool,
}

/// The bytecode-rewriter this crate installs into the host runtime.
pub trait ClassFileTransformer: Send + Sync {
    /// Rewrites `bytes` for `class` if it matches a live trace request. On
    /// any failure the original bytes are returned unchanged and the error
    /// is logged -- this method itself never fails.
    fn transform(&self, class: &LoadedClass, bytes: &[u8]) -> Vec<u8>;
}

/// The host runtime's instrumentation facility, consumed by the
/// [`crate::controller::Controller`].
pub trait HostRuntime: Send + Sync {
    /// Registers the bytecode-rewriter the core provides. Called once,
    /// during setup.
    fn install_class_file_transformer(&self, transformer: Arc<dyn ClassFileTransformer>);

    /// Requests that the transformer be re-invoked on each of `classes`.
    /// Must be callable from the controller's worker thread; must not
    /// assume it is the only caller.
    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<(), HostError>;

    fn all_loaded_classes(&self) -> Vec<LoadedClass>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A cancelable progress handle for a long-running retransform.
pub trait ProgressHandle: Send + Sync {
    fn is_canceled(&self) -> bool;
    fn set_fraction(&self, fraction: f64);
}

/// The view, consumed by the [`crate::controller::Controller`]. A real
/// implementation marshals each call onto the UI thread and blocks until
/// it completes ("invoke-and-wait"), which is how the refresh loop
/// naturally throttles to paint speed; this crate only calls these
/// methods synchronously and trusts the implementation to do that
/// marshaling.
pub trait ViewHandle: Send + Sync {
    fn refresh_call_tree_data(
        &self,
        tree: Arc<crate::call_tree::CallTree>,
        flat_stats: Vec<crate::aggregate::FlatTracepointStats>,
    );

    fn show_command_line_popup(&self, message: &str, severity: Severity);

    fn create_progress_indicator(&self) -> Box<dyn ProgressHandle>;

    /// Writes a raster snapshot of the view to an absolute filesystem
    /// path. The controller only validates that the
    /// path is absolute; the rendering itself is entirely the view's
    /// concern.
    fn save_snapshot(&self, path: &std::path::Path);
}

/// A progress handle that is never canceled -- convenient default for
/// hosts (or tests) that don't offer cancellation.
pub struct NeverCanceled;

impl ProgressHandle for NeverCanceled {
    fn is_canceled(&self) -> bool {
        false
    }

    fn set_fraction(&self, _fraction: f64) {}
}
