//! Drives a [`Controller`] through a short command session against a
//! fake host runtime and a view that prints to stdout. The real bytecode
//! library and UI widgets live outside this crate; here the simplest
//! things that satisfy the [`callray::host`] traits stand in for them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use callray::aggregate::FlatTracepointStats;
use callray::call_tree::CallTree;
use callray::controller::Controller;
use callray::display::{DisplayableCallTree, DisplayableFlatStats};
use callray::error::HostError;
use callray::fqname::MethodFqName;
use callray::hook::Hook;
use callray::host::{
    ClassFileTransformer, HostRuntime, LoadedClass, MethodSignature, NeverCanceled, ProgressHandle,
    Severity, ViewHandle,
};
use callray::transform::NullBytecodeBackend;
use callray::Tracer;

/// One loaded class, `demo.Greeter`, with two methods. Retransforming it
/// just re-runs the installed [`ClassFileTransformer`] against a fixed
/// byte string -- there is no real class loader here, only the decision
/// logic the transformer owns.
struct FakeHost {
    transformer: Mutex<Option<Arc<dyn ClassFileTransformer>>>,
    retransform_count: AtomicUsize,
}

impl FakeHost {
    fn new() -> Self {
        FakeHost {
            transformer: Mutex::new(None),
            retransform_count: AtomicUsize::new(0),
        }
    }

    fn greeter_class() -> LoadedClass {
        LoadedClass {
            fqcn: "demo.Greeter".to_string(),
            methods: vec![
                MethodSignature {
                    name: "greet".to_string(),
                    descriptor: "(Ljava/lang/String;)V".to_string(),
                    param_count: 1,
                    is_constructor: false,
                },
                MethodSignature {
                    name: "farewell".to_string(),
                    descriptor: "()V".to_string(),
                    param_count: 0,
                    is_constructor: false,
                },
            ],
            modifiable: true,
        }
    }
}

impl HostRuntime for FakeHost {
    fn install_class_file_transformer(&self, transformer: Arc<dyn ClassFileTransformer>) {
        *self.transformer.lock().unwrap() = Some(transformer);
    }

    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<(), HostError> {
        let transformer = self.transformer.lock().unwrap().clone();
        if let Some(transformer) = transformer {
            for class in classes {
                transformer.transform(class, b"<classfile bytes>");
            }
        }
        self.retransform_count.fetch_add(classes.len(), Ordering::SeqCst);
        Ok(())
    }

    fn all_loaded_classes(&self) -> Vec<LoadedClass> {
        vec![Self::greeter_class()]
    }
}

struct StdoutView;

impl ViewHandle for StdoutView {
    fn refresh_call_tree_data(&self, tree: Arc<CallTree>, flat_stats: Vec<FlatTracepointStats>) {
        println!("--- refresh ---");
        println!("{}", DisplayableCallTree { tree: tree.as_ref(), left_margin: 0 });
        println!("{}", DisplayableFlatStats { stats: &flat_stats });
    }

    fn show_command_line_popup(&self, message: &str, severity: Severity) {
        println!("[{severity:?}] {message}");
    }

    fn create_progress_indicator(&self) -> Box<dyn ProgressHandle> {
        Box::new(NeverCanceled)
    }

    fn save_snapshot(&self, path: &std::path::Path) {
        println!("(would save a snapshot to {})", path.display());
    }
}

/// Stands in for bytecode that calls the hook directly around `greet`.
fn call_greet(tracer: &Tracer) {
    let fq = MethodFqName::new("demo.Greeter", "greet", "(Ljava/lang/String;)V");
    if let Some(data) = tracer.config().get_method_trace_data(&fq) {
        tracer.hook().enter(data.method_id, None);
        tracer.hook().leave();
    }
}

fn main() {
    // This crate never installs a subscriber itself (it is a library that
    // sits inside another program's instrumentation) -- the host
    // application wires one up, same as any other `tracing` producer.
    tracing_subscriber::fmt().with_target(false).init();

    let tracer = Tracer::new();
    let host = Arc::new(FakeHost::new());
    host.install_class_file_transformer(tracer.transformer(Arc::new(NullBytecodeBackend)));

    let controller = Controller::new(
        tracer.config(),
        tracer.manager(),
        host.clone(),
        Arc::new(StdoutView),
        Duration::from_millis(50),
    );

    controller.submit_command("trace demo.Greeter#greet");
    std::thread::sleep(Duration::from_millis(20));

    call_greet(&tracer);
    call_greet(&tracer);

    controller.submit_command("frobnicate nonsense"); // rejected, reported via the view's popup
    controller.submit_command("untrace demo.Greeter#greet");
    controller.submit_command("reset");

    std::thread::sleep(Duration::from_millis(150));
    println!(
        "classes retransformed so far: {}",
        host.retransform_count.load(Ordering::SeqCst)
    );
}
