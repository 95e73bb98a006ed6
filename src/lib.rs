//! An interactive, in-process method tracer for managed runtimes that
//! support load-time and retransform-time bytecode rewriting. A short
//! command ("trace Foo#bar", "untrace \*", "trace count Foo#bar\[0,2\]")
//! instruments the matching methods so that every subsequent invocation
//! records entry/exit events, builds a per-thread call tree, and is
//! periodically aggregated for display -- flat statistics by tracepoint,
//! plus a hierarchical view.
//!
//! The hard engineering lives in five collaborating pieces, leaves first:
//!
//! * [`id_list`] -- an append-only table handing out stable method IDs.
//! * [`config`] -- the trace-request registry ("does class X need
//!   instrumenting? what config applies to method X.m(desc)?").
//! * [`call_tree`] / [`manager`] -- the per-thread call-tree builder and
//!   the manager that owns one builder per thread, merges them into a
//!   snapshot on demand, and suppresses hook re-entry.
//! * [`transform`] -- decides which methods a loaded class needs woven
//!   (entry/normal-exit/exceptional-exit), delegating the actual
//!   byte-level rewrite to a host-supplied [`host::ClassFileTransformer`]
//!   backend.
//! * [`controller`] -- parses commands and serializes configuration
//!   changes and periodic aggregation onto a single background worker.
//!
//! This crate does not itself talk to a bytecode library or a concrete
//! managed runtime -- those are external collaborators, described only
//! through the [`host`] traits a host application implements. Wire one up
//! and drive it through [`Tracer`]:
//!
//! ```
//! use callray::Tracer;
//! use callray::controller::Controller;
//! use std::sync::Arc;
//! # use callray::host::{ClassFileTransformer, HostRuntime, LoadedClass, ProgressHandle, Severity, ViewHandle};
//! # use callray::error::HostError;
//! # use callray::call_tree::CallTree;
//! # use callray::aggregate::FlatTracepointStats;
//! # struct NoHost;
//! # impl HostRuntime for NoHost {
//! #     fn install_class_file_transformer(&self, _t: Arc<dyn ClassFileTransformer>) {}
//! #     fn retransform_classes(&self, _c: &[LoadedClass]) -> Result<(), HostError> { Ok(()) }
//! #     fn all_loaded_classes(&self) -> Vec<LoadedClass> { Vec::new() }
//! # }
//! # struct NoView;
//! # impl ViewHandle for NoView {
//! #     fn refresh_call_tree_data(&self, _t: Arc<CallTree>, _s: Vec<FlatTracepointStats>) {}
//! #     fn show_command_line_popup(&self, _m: &str, _s: Severity) {}
//! #     fn create_progress_indicator(&self) -> Box<dyn ProgressHandle> {
//! #         Box::new(callray::host::NeverCanceled)
//! #     }
//! #     fn save_snapshot(&self, _p: &std::path::Path) {}
//! # }
//!
//! let tracer = Tracer::new();
//! let host = Arc::new(NoHost);
//! let backend = Arc::new(callray::transform::NullBytecodeBackend);
//! host.install_class_file_transformer(tracer.transformer(backend));
//!
//! let controller = Controller::new(
//!     tracer.config(),
//!     tracer.manager(),
//!     host,
//!     Arc::new(NoView),
//!     std::time::Duration::from_millis(500),
//! );
//! controller.submit_command("trace com.example.Foo#bar");
//! ```

pub mod aggregate;
pub mod call_tree;
pub mod config;
pub mod controller;
pub mod display;
pub mod error;
pub mod fqname;
pub mod hook;
pub mod host;
pub mod id_list;
pub mod manager;
pub mod matcher;
pub mod tracepoint;
pub mod transform;

use std::sync::Arc;

use config::TraceConfig;
use hook::{Hook, TracerHook};
use manager::CallTreeManager;
use transform::{BytecodeBackend, BytecodeWeaver};

/// Configure & build a [`Tracer`].
pub struct TracerBuilder {
    clock: Option<quanta::Clock>,
    max_call_depth: usize,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        TracerBuilder {
            clock: None,
            max_call_depth: 512,
        }
    }
}

impl TracerBuilder {
    /// The clock used to measure wall time. Defaults to a real clock;
    /// inject a mock one (`quanta::Clock::mock()`) for tests.
    pub fn clock(mut self, clock: quanta::Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Call paths below this depth are folded into their deepest kept
    /// ancestor rather than growing the tree without bound.
    pub fn max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn build(self) -> Tracer {
        let config = Arc::new(TraceConfig::new());
        let mut manager_builder = CallTreeManager::builder().max_call_depth(self.max_call_depth);
        if let Some(clock) = self.clock {
            manager_builder = manager_builder.clock(clock);
        }
        let manager = Arc::new(manager_builder.build());
        let hook = Arc::new(TracerHook::new(config.clone(), manager.clone()));
        let installed = hook::install_global_hook(hook.clone());
        if !installed {
            tracing::warn!("global tracer hook already installed; a second Tracer in this process will not receive hook calls");
        }

        Tracer {
            config,
            manager,
            hook,
        }
    }
}

/// Ties the trace-request registry ([`TraceConfig`]), the per-thread call
/// tree manager ([`CallTreeManager`]) and the process-wide hook together,
/// and hands out a [`BytecodeWeaver`] ready to install into a host
/// runtime. A host application builds one `Tracer`, installs its
/// [`Tracer::transformer`] into the instrumentation facility, and drives
/// configuration changes through a [`controller::Controller`] built from
/// [`Tracer::config`] and [`Tracer::manager`].
pub struct Tracer {
    config: Arc<TraceConfig>,
    manager: Arc<CallTreeManager>,
    hook: Arc<TracerHook>,
}

impl Default for Tracer {
    fn default() -> Self {
        TracerBuilder::default().build()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    pub fn config(&self) -> Arc<TraceConfig> {
        self.config.clone()
    }

    pub fn manager(&self) -> Arc<CallTreeManager> {
        self.manager.clone()
    }

    /// Direct access to the hook, mostly useful for tests that want to
    /// call `enter`/`leave` without going through a real bytecode weave.
    pub fn hook(&self) -> Arc<TracerHook> {
        self.hook.clone()
    }

    /// A [`host::ClassFileTransformer`] that rewrites matching classes
    /// using `backend` for the actual byte-level weave. Install this into
    /// the host runtime's instrumentation facility.
    pub fn transformer(&self, backend: Arc<dyn BytecodeBackend>) -> Arc<BytecodeWeaver> {
        Arc::new(BytecodeWeaver::new(self.config.clone(), backend))
    }
}
