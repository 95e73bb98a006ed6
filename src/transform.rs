//! Class file transformer.
//!
//! The concrete bytecode library is an external collaborator: this
//! module owns the *decisions* -- which methods to rewrite, which
//! parameters to capture, the constructor caveat, what to do on failure --
//! and delegates the actual byte-level weaving to an injected
//! [`BytecodeBackend`].

use std::sync::Arc;

use crate::config::{MethodId, TraceConfig};
use crate::error::TransformError;
use crate::fqname::MethodFqName;
use crate::host::{ClassFileTransformer, LoadedClass, MethodSignature};

/// What the backend needs to know to weave one method: the ID to embed in
/// the `enter` call, which parameter indices to capture (already filtered
/// to the method's actual parameter list), and whether the entry hook must
/// be placed after the superclass constructor call returns rather than at
/// the very start of the method.
#[derive(Debug, Clone)]
pub struct InstrumentationPlan {
    pub method_id: MethodId,
    pub captured_param_indices: Vec<usize>,
    pub instrument_after_super_constructor: bool,
}

/// The actual bytecode-level rewrite, supplied by the host application.
pub trait BytecodeBackend: Send + Sync {
    /// Weaves entry/normal-exit/exceptional-exit calls into `bytes`
    /// according to `plan`. Returns
    /// [`TransformError::SuperConstructorUnreachable`] if `plan` requires
    /// post-super-constructor placement and no safe insertion point can be
    /// found.
    fn weave_method(
        &self,
        class: &LoadedClass,
        method: &MethodSignature,
        plan: &InstrumentationPlan,
        bytes: &[u8],
    ) -> Result<Vec<u8>, TransformError>;
}

/// A backend that always succeeds, returning `bytes` unchanged. Lets
/// [`BytecodeWeaver`]'s own orchestration logic (method selection,
/// parameter filtering, constructor handling, failure recovery) be tested
/// without a real bytecode library.
#[derive(Debug, Default)]
pub struct NullBytecodeBackend;

impl BytecodeBackend for NullBytecodeBackend {
    fn weave_method(
        &self,
        _class: &LoadedClass,
        _method: &MethodSignature,
        _plan: &InstrumentationPlan,
        bytes: &[u8],
    ) -> Result<Vec<u8>, TransformError> {
        Ok(bytes.to_vec())
    }
}

/// Filters `requested` parameter indices to those within
/// `[0, param_count)`, preserving order, and logs the ones that were
/// dropped.
fn filter_traced_params(requested: &[usize], param_count: usize, method: &MethodFqName) -> Vec<usize> {
    let mut in_range = Vec::with_capacity(requested.len());
    let mut out_of_range = Vec::new();
    for &idx in requested {
        if idx < param_count {
            in_range.push(idx);
        } else {
            out_of_range.push(idx);
        }
    }
    if !out_of_range.is_empty() {
        tracing::warn!(
            method = %method,
            out_of_range = ?out_of_range,
            "requested parameter indices out of range, filtered"
        );
    }
    in_range
}

/// Rewrites matching classes so that every method a live trace request
/// covers invokes the hook at entry, normal exit, and exceptional exit.
pub struct BytecodeWeaver {
    config: Arc<TraceConfig>,
    backend: Arc<dyn BytecodeBackend>,
}

impl BytecodeWeaver {
    pub fn new(config: Arc<TraceConfig>, backend: Arc<dyn BytecodeBackend>) -> Self {
        BytecodeWeaver { config, backend }
    }
}

impl ClassFileTransformer for BytecodeWeaver {
    fn transform(&self, class: &LoadedClass, bytes: &[u8]) -> Vec<u8> {
        if !self.config.should_instrument_class(&class.fqcn) {
            return bytes.to_vec();
        }

        if !class.modifiable {
            tracing::warn!(class = %class.fqcn, "class is not modifiable, skipping instrumentation");
            return bytes.to_vec();
        }

        let mut current = bytes.to_vec();
        for method in &class.methods {
            let fq_name = MethodFqName::new(
                class.fqcn.clone(),
                method.name.clone(),
                method.descriptor.clone(),
            );
            let Some(data) = self.config.get_method_trace_data(&fq_name) else {
                continue;
            };
            if !data.config.enabled {
                continue;
            }

            let captured_param_indices =
                filter_traced_params(&data.config.traced_params, method.param_count, &fq_name);
            let plan = InstrumentationPlan {
                method_id: data.method_id,
                captured_param_indices,
                instrument_after_super_constructor: method.is_constructor,
            };

            match self.backend.weave_method(class, method, &plan, &current) {
                Ok(rewritten) => current = rewritten,
                Err(TransformError::SuperConstructorUnreachable(_)) => {
                    tracing::warn!(
                        method = %fq_name,
                        "no safe entry point after the superclass constructor; skipping to avoid a mismatched enter/leave pair"
                    );
                }
                Err(err) => {
                    tracing::error!(method = %fq_name, error = %err, "bytecode rewrite failed, method left unchanged");
                }
            }
        }
        current
    }
}
