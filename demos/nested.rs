//! Drives the tracer directly through its hook, the way woven bytecode
//! would, over a small tree of nested calls. There is no bytecode weaver
//! in this process, so the calls below stand in for it with explicit
//! enter/leave pairs around each "method" body.

use callray::config::{MethodConfig, MethodMatcher, TraceRequest};
use callray::display::{DisplayableCallTree, DisplayableFlatStats};
use callray::fqname::MethodFqName;
use callray::hook::Hook;
use callray::matcher::{ClassPattern, MethodPattern};
use callray::{aggregate, Tracer};

/// Stands in for "instrumented bytecode calling the hook": looks up the
/// method's trace data, enters, runs `body`, leaves -- even if `body`
/// panics, thanks to the hook's own catch-unwind guarding its enter/leave
/// pairing.
fn traced<R>(tracer: &Tracer, method: &str, body: impl FnOnce() -> R) -> R {
    let fq = MethodFqName::new("demo.Nested", method, "()V");
    match tracer.config().get_method_trace_data(&fq) {
        Some(data) => {
            tracer.hook().enter(data.method_id, None);
            let result = body();
            tracer.hook().leave();
            result
        }
        None => body(),
    }
}

fn main() {
    let tracer = Tracer::new();
    tracer.config().append_trace_request(TraceRequest::new(
        MethodMatcher::new(ClassPattern::new("demo.Nested"), Some(MethodPattern::new("*"))),
        MethodConfig::enabled_all(vec![]),
    ));

    fn repeated(tracer: &Tracer, repetition: i32) {
        traced(tracer, "repeated", || {
            let _ = repetition;
        });
    }

    fn random(tracer: &Tracer) {
        traced(tracer, "random", || {});
    }

    fn nested(tracer: &Tracer) {
        traced(tracer, "nested", || {
            random(tracer);
            for i in 1..=1000 {
                repeated(tracer, i);
            }
        });
    }

    fn nested2(tracer: &Tracer) {
        traced(tracer, "nested2", || {
            random(tracer);
            for i in 1..=1000 {
                repeated(tracer, i);
            }
            nested(tracer);
        });
    }

    fn nest_deeply(tracer: &Tracer, depth: usize) {
        traced(tracer, "nest_deeply", || {
            if depth > 0 {
                nest_deeply(tracer, depth - 1);
            }
        });
    }

    fn request(tracer: &Tracer) {
        traced(tracer, "request", || {
            nested(tracer);
            repeated(tracer, -1);
            repeated(tracer, -2);
            nest_deeply(tracer, 10);
            nested2(tracer);
        });
    }

    request(&tracer);

    let tree = tracer.manager().snapshot_all_threads_merged();
    let stats = aggregate::compute_flat_tracepoint_stats(&tree);

    println!("{}", DisplayableCallTree { tree: &tree, left_margin: 0 });
    println!();
    println!("{}", DisplayableFlatStats { stats: &stats });
}
