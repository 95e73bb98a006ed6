//! Whole-pipeline behavior that spans Controller, trace config, the
//! bytecode weaver, and the per-thread call-tree manager together --
//! too cross-cutting to fit inside any one module's own test module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use callray::aggregate::compute_flat_tracepoint_stats;
use callray::call_tree::CallTree;
use callray::config::{MethodConfig, MethodMatcher, TraceConfig, TraceRequest};
use callray::controller::Controller;
use callray::error::HostError;
use callray::fqname::MethodFqName;
use callray::hook::{Hook, TracerHook};
use callray::host::{
    ClassFileTransformer, HostRuntime, LoadedClass, MethodSignature, NeverCanceled, ProgressHandle,
    Severity, ViewHandle,
};
use callray::manager::CallTreeManager;
use callray::matcher::{ClassPattern, MethodPattern};
use callray::transform::BytecodeWeaver;

fn method_fq(method: &str) -> MethodFqName {
    MethodFqName::new("com.example.Foo", method, "()V")
}

fn method_tp(name: &str) -> callray::tracepoint::Tracepoint {
    callray::tracepoint::Tracepoint::Method(Arc::new(callray::tracepoint::MethodTracepoint::new(
        method_fq(name),
    )))
}

/// Simple nesting, clock advancing by one tick per step.
#[test]
fn simple_nesting_matches_expected_tree() {
    let (clock, mock) = quanta::Clock::mock();
    let mut builder = callray::call_tree::CallTreeBuilder::new(clock, 64);

    builder.push(method_tp("simple1"));
    builder.push(method_tp("simple2"));
    builder.push(method_tp("simple3"));
    mock.increment(1);
    builder.pop(); // simple3
    builder.pop(); // simple2
    mock.increment(1);
    builder.pop(); // simple1

    let tree = builder.borrow_up_to_date_tree();
    assert_eq!(tree.root().call_count(), 0);

    let (_, idx1) = tree.root().children().next().unwrap();
    let simple1 = tree.node(idx1);
    assert_eq!(simple1.call_count(), 1);
    assert_eq!(simple1.wall_time(), Duration::from_nanos(2));

    let (_, idx2) = simple1.children().next().unwrap();
    let simple2 = tree.node(idx2);
    assert_eq!(simple2.call_count(), 1);
    assert_eq!(simple2.wall_time(), Duration::from_nanos(1));

    let (_, idx3) = simple2.children().next().unwrap();
    let simple3 = tree.node(idx3);
    assert_eq!(simple3.call_count(), 1);
    assert_eq!(simple3.wall_time(), Duration::from_nanos(1));
}

/// Mutual recursion A -> B -> A -> B counts every call but only the
/// outermost frame's wall time for each tracepoint.
#[test]
fn mutual_recursion_is_recursion_safe() {
    let (clock, mock) = quanta::Clock::mock();
    let mut builder = callray::call_tree::CallTreeBuilder::new(clock, 64);
    let a = method_tp("a");
    let b = method_tp("b");

    builder.push(a.clone());
    mock.increment(1);
    builder.push(b.clone());
    mock.increment(1);
    builder.push(a.clone());
    mock.increment(1);
    builder.push(b.clone());
    mock.increment(1);
    builder.pop();
    builder.pop();
    builder.pop();
    builder.pop();

    let tree = builder.borrow_up_to_date_tree();
    let stats = compute_flat_tracepoint_stats(tree);
    let stats_a = stats.iter().find(|s| s.tracepoint.display_name() == "a").unwrap();
    let stats_b = stats.iter().find(|s| s.tracepoint.display_name() == "b").unwrap();
    assert_eq!(stats_a.call_count, 2);
    assert_eq!(stats_b.call_count, 2);
    assert_eq!(stats_a.wall_time, Duration::from_nanos(4));
    assert_eq!(stats_b.wall_time, Duration::from_nanos(3));
}

struct RecordingHost {
    transformer: Mutex<Option<Arc<dyn ClassFileTransformer>>>,
    class: LoadedClass,
    retransform_count: AtomicUsize,
}

impl RecordingHost {
    fn new(class: LoadedClass) -> Self {
        RecordingHost {
            transformer: Mutex::new(None),
            class,
            retransform_count: AtomicUsize::new(0),
        }
    }
}

impl HostRuntime for RecordingHost {
    fn install_class_file_transformer(&self, transformer: Arc<dyn ClassFileTransformer>) {
        *self.transformer.lock().unwrap() = Some(transformer);
    }

    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<(), HostError> {
        let transformer = self.transformer.lock().unwrap().clone();
        if let Some(transformer) = transformer {
            for class in classes {
                transformer.transform(class, b"<bytes>");
            }
        }
        self.retransform_count.fetch_add(classes.len(), Ordering::SeqCst);
        Ok(())
    }

    fn all_loaded_classes(&self) -> Vec<LoadedClass> {
        vec![self.class.clone()]
    }
}

struct SilentView {
    popups: Mutex<Vec<(String, Severity)>>,
}

impl SilentView {
    fn new() -> Self {
        SilentView { popups: Mutex::new(Vec::new()) }
    }
}

impl ViewHandle for SilentView {
    fn refresh_call_tree_data(&self, _tree: Arc<CallTree>, _flat_stats: Vec<callray::aggregate::FlatTracepointStats>) {}

    fn show_command_line_popup(&self, message: &str, severity: Severity) {
        self.popups.lock().unwrap().push((message.to_string(), severity));
    }

    fn create_progress_indicator(&self) -> Box<dyn ProgressHandle> {
        Box::new(NeverCanceled)
    }

    fn save_snapshot(&self, _path: &std::path::Path) {}
}

fn foo_class() -> LoadedClass {
    LoadedClass {
        fqcn: "com.example.Foo".to_string(),
        methods: vec![MethodSignature {
            name: "bar".to_string(),
            descriptor: "()V".to_string(),
            param_count: 0,
            is_constructor: false,
        }],
        modifiable: true,
    }
}

/// `trace count` leaves wall time at zero; a later `trace all` for the
/// same method flips `measureWallTime` so the next retransform starts
/// accumulating wall time.
#[test]
fn count_only_then_all_flips_wall_time_measurement() {
    let config = Arc::new(TraceConfig::new());
    let manager = Arc::new(CallTreeManager::builder().build());
    let host = Arc::new(RecordingHost::new(foo_class()));
    let view = Arc::new(SilentView::new());
    host.install_class_file_transformer(Arc::new(BytecodeWeaver::new(
        config.clone(),
        Arc::new(callray::transform::NullBytecodeBackend),
    )));

    let controller = Controller::builder(config.clone(), manager.clone(), host.clone(), view)
        .refresh_period(Duration::from_secs(3600))
        .build();

    controller.submit_command("trace count com.example.Foo#bar");
    std::thread::sleep(Duration::from_millis(50));

    let hook = TracerHook::new(config.clone(), manager.clone());
    let fq = method_fq("bar");
    let data = config.get_method_trace_data(&fq).unwrap();
    assert!(data.config.count_only);

    hook.enter(data.method_id, None);
    hook.leave();
    hook.enter(data.method_id, None);
    hook.leave();

    let tree = manager.snapshot_all_threads_merged();
    let (_, idx) = tree.root().children().next().unwrap();
    assert_eq!(tree.node(idx).call_count(), 2);
    assert_eq!(tree.node(idx).wall_time(), Duration::ZERO);

    controller.submit_command("trace all com.example.Foo#bar");
    std::thread::sleep(Duration::from_millis(50));

    let tracepoint = config.get_method_tracepoint(data.method_id);
    assert!(tracepoint.measures_wall_time());
}

/// `untrace *` after a prior `trace` disables further instrumentation
/// but leaves already-recorded call-tree data alone.
#[test]
fn untrace_disables_without_clearing_existing_data() {
    let config = Arc::new(TraceConfig::new());
    let manager = Arc::new(CallTreeManager::builder().build());
    let hook = TracerHook::new(config.clone(), manager.clone());

    config.append_trace_request(TraceRequest::new(
        MethodMatcher::new(ClassPattern::new("com.example.Foo"), Some(MethodPattern::new("*"))),
        MethodConfig::enabled_all(vec![]),
    ));
    let fq = method_fq("bar");
    let data = config.get_method_trace_data(&fq).unwrap();
    hook.enter(data.method_id, None);
    hook.leave();

    config.append_trace_request(TraceRequest::new(
        MethodMatcher::new(ClassPattern::new("*"), None),
        MethodConfig::disabled(),
    ));

    let resolved = config.get_method_trace_data(&fq).unwrap();
    assert!(!resolved.config.enabled);

    // Existing call-tree data survives the untrace.
    let tree = manager.snapshot_all_threads_merged();
    assert_eq!(tree.root().children().count(), 1);
}

/// An instrumented method that throws still has its wall time measured
/// from enter to the rethrow, and the hook never suppresses the unwind
/// itself (it only swallows its own invariant panics, not the
/// instrumented code's).
#[test]
fn wall_time_is_measured_even_when_the_call_unwinds() {
    let config = Arc::new(TraceConfig::new());
    let manager = Arc::new(CallTreeManager::builder().build());
    let hook = TracerHook::new(config.clone(), manager.clone());

    config.append_trace_request(TraceRequest::new(
        MethodMatcher::new(ClassPattern::new("com.example.Foo"), Some(MethodPattern::new("bar"))),
        MethodConfig::enabled_all(vec![]),
    ));
    let fq = method_fq("bar");
    let data = config.get_method_trace_data(&fq).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        hook.enter(data.method_id, None);
        struct LeaveOnDrop<'a>(&'a TracerHook);
        impl<'a> Drop for LeaveOnDrop<'a> {
            fn drop(&mut self) {
                self.0.leave();
            }
        }
        let _guard = LeaveOnDrop(&hook);
        panic!("user code threw");
    }));
    assert!(result.is_err());

    let tree = manager.snapshot_all_threads_merged();
    assert_eq!(tree.root().children().count(), 1);
    let (_, idx) = tree.root().children().next().unwrap();
    assert_eq!(tree.node(idx).call_count(), 1);
}

struct UnavailableHost;

impl HostRuntime for UnavailableHost {
    fn install_class_file_transformer(&self, _transformer: Arc<dyn ClassFileTransformer>) {}

    fn retransform_classes(&self, _classes: &[LoadedClass]) -> Result<(), HostError> {
        Err(HostError::Unavailable)
    }

    fn all_loaded_classes(&self) -> Vec<LoadedClass> {
        vec![foo_class()]
    }
}

/// Once the host runtime's instrumentation facility reports itself
/// unavailable, tracing is permanently disabled: the command that
/// triggered it gets the one-line warning, and every later command
/// requiring transformation gets the same warning instead of touching the
/// host again. `clear` keeps working throughout since it never needs the
/// host.
#[test]
fn host_unavailable_permanently_disables_commands_that_need_transformation() {
    let config = Arc::new(TraceConfig::new());
    let manager = Arc::new(CallTreeManager::builder().build());
    let host = Arc::new(UnavailableHost);
    let view = Arc::new(SilentView::new());

    let controller = Controller::builder(config, manager.clone(), host, view.clone())
        .refresh_period(Duration::from_secs(3600))
        .build();

    controller.submit_command("trace com.example.Foo#bar");
    std::thread::sleep(Duration::from_millis(50));
    controller.submit_command("trace com.example.Foo#baz");
    std::thread::sleep(Duration::from_millis(50));

    let popups = view.popups.lock().unwrap();
    assert_eq!(popups.len(), 2);
    assert!(popups.iter().all(|(_, severity)| *severity == Severity::Warning));
    assert!(popups.iter().all(|(message, _)| message.contains("permanently disabled")));
    drop(popups);

    // `clear` never needs the host, so it still works after disablement.
    controller.submit_command("clear");
    std::thread::sleep(Duration::from_millis(50));
}

/// A calling B is genuine nesting, not reentrancy, and the busy-flag
/// guard that exists to suppress a pathological reentrant hook call must
/// never mistake this for one -- the A->B edge is recorded exactly once,
/// with B nested correctly beneath A. The reentrant-suppression case
/// needs access to the manager's private per-thread busy flag and is
/// covered directly in `callray::manager`'s own test module instead.
#[test]
fn genuine_nested_calls_are_not_mistaken_for_reentrancy() {
    let config = Arc::new(TraceConfig::new());
    let manager = Arc::new(CallTreeManager::builder().build());
    let hook = TracerHook::new(config.clone(), manager.clone());

    config.append_trace_request(TraceRequest::new(
        MethodMatcher::new(ClassPattern::new("com.example.Foo"), Some(MethodPattern::new("*"))),
        MethodConfig::enabled_all(vec![]),
    ));

    let a = config.get_method_trace_data(&method_fq("a")).unwrap();
    let b = config.get_method_trace_data(&method_fq("b")).unwrap();

    hook.enter(a.method_id, None);
    hook.enter(b.method_id, None);
    hook.leave();
    hook.leave();

    let tree = manager.snapshot_all_threads_merged();
    assert_eq!(tree.root().children().count(), 1);
    let (tp, idx) = tree.root().children().next().unwrap();
    assert_eq!(tp.display_name(), "a");
    let node_a = tree.node(idx);
    assert_eq!(node_a.call_count(), 1);
    assert_eq!(node_a.children().count(), 1);
    let (tp_b, idx_b) = node_a.children().next().unwrap();
    assert_eq!(tp_b.display_name(), "b");
    assert_eq!(tree.node(idx_b).call_count(), 1);
}
