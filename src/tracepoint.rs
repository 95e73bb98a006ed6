//! Tracepoint identity.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::fqname::MethodFqName;

/// The value a captured argument is stringified from. Stands in for "boxed
/// primitive or captured reference" -- the concrete managed-runtime value
/// representation is an external collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Char(char),
    I64(i64),
    F64(f64),
    Str(String),
    /// A reference type captured as-is; `debug` is whatever the host
    /// runtime's own `toString`/`Debug` rendering produced.
    Ref(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Char(c) => write!(f, "{c}"),
            ArgValue::I64(i) => write!(f, "{i}"),
            ArgValue::F64(x) => write!(f, "{x}"),
            ArgValue::Str(s) => write!(f, "{s}"),
            ArgValue::Ref(s) => write!(f, "{s}"),
        }
    }
}

/// Immutable identity of a traced method, plus the one bit of mutable
/// measurement config the hot path needs to consult: whether wall time
/// should be measured for calls to it.
///
/// There is exactly one canonical `MethodTracepoint` per `MethodFqName`,
/// enforced by [`crate::config::TraceConfig`], not by this type itself.
#[derive(Debug)]
pub struct MethodTracepoint {
    fq_name: MethodFqName,
    display_name: String,
    measure_wall_time: AtomicBool,
}

impl MethodTracepoint {
    pub fn new(fq_name: MethodFqName) -> Self {
        let display_name = fq_name.method.clone();
        MethodTracepoint {
            fq_name,
            display_name,
            measure_wall_time: AtomicBool::new(true),
        }
    }

    pub fn fq_name(&self) -> &MethodFqName {
        &self.fq_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn detailed_name(&self) -> String {
        format!("{}#{}{}", self.fq_name.class, self.fq_name.method, self.fq_name.descriptor)
    }

    pub fn measures_wall_time(&self) -> bool {
        self.measure_wall_time.load(Ordering::Relaxed)
    }

    pub fn set_measures_wall_time(&self, measure: bool) {
        self.measure_wall_time.store(measure, Ordering::Relaxed);
    }
}

// Tracepoints are compared/hashed by identity -- two distinct
// `MethodTracepoint`s with the same `MethodFqName` should never exist
// (the config registry enforces that), but Eq/Hash here are defined over
// the backing address so that `Arc<MethodTracepoint>` works as a
// `HashMap` key for a node's children without requiring `PartialEq` on the
// mutable `measure_wall_time` bit.
impl PartialEq for MethodTracepoint {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for MethodTracepoint {}
impl std::hash::Hash for MethodTracepoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self as *const Self).hash(state)
    }
}

/// A tracepoint: either the synthetic root of every call tree, a canonical
/// method tracepoint, or a method tracepoint stamped with captured argument
/// values for one particular call.
#[derive(Debug, Clone)]
pub enum Tracepoint {
    Root,
    Method(std::sync::Arc<MethodTracepoint>),
    MethodWithArgs(std::sync::Arc<MethodTracepoint>, Vec<ArgValue>),
}

impl Tracepoint {
    /// The backing method tracepoint, shared between a plain and an
    /// arg-stamped wrapper of the same method.
    pub fn backing_method(&self) -> Option<&std::sync::Arc<MethodTracepoint>> {
        match self {
            Tracepoint::Root => None,
            Tracepoint::Method(tp) | Tracepoint::MethodWithArgs(tp, _) => Some(tp),
        }
    }

    pub fn measures_wall_time(&self) -> bool {
        match self {
            Tracepoint::Root => false,
            Tracepoint::Method(tp) | Tracepoint::MethodWithArgs(tp, _) => tp.measures_wall_time(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Tracepoint::Root => "[root]".to_string(),
            Tracepoint::Method(tp) => tp.display_name().to_string(),
            Tracepoint::MethodWithArgs(tp, args) => {
                let args = args
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({})", tp.display_name(), args)
            }
        }
    }
}

/// Equality/hash of a `Tracepoint` for the purposes of the call tree's
/// child map: structural over (backing tracepoint identity, arg
/// strings).
impl PartialEq for Tracepoint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Tracepoint::Root, Tracepoint::Root) => true,
            (Tracepoint::Method(a), Tracepoint::Method(b)) => std::sync::Arc::ptr_eq(a, b),
            (Tracepoint::MethodWithArgs(a, aargs), Tracepoint::MethodWithArgs(b, bargs)) => {
                std::sync::Arc::ptr_eq(a, b) && aargs == bargs
            }
            _ => false,
        }
    }
}
impl Eq for Tracepoint {}
impl std::hash::Hash for Tracepoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Tracepoint::Root => 0u8.hash(state),
            Tracepoint::Method(tp) => {
                1u8.hash(state);
                (std::sync::Arc::as_ptr(tp) as usize).hash(state);
            }
            Tracepoint::MethodWithArgs(tp, args) => {
                2u8.hash(state);
                (std::sync::Arc::as_ptr(tp) as usize).hash(state);
                for arg in args {
                    match arg {
                        ArgValue::Bool(b) => b.hash(state),
                        ArgValue::Char(c) => c.hash(state),
                        ArgValue::I64(i) => i.hash(state),
                        ArgValue::F64(x) => x.to_bits().hash(state),
                        ArgValue::Str(s) | ArgValue::Ref(s) => s.hash(state),
                    }
                }
            }
        }
    }
}
