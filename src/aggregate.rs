//! Flat per-tracepoint statistics derived from a call tree.

use std::collections::HashSet;
use std::time::Duration;

use crate::call_tree::CallTree;
use crate::tracepoint::Tracepoint;

/// Per-tracepoint totals across every node of a tree that carries that
/// tracepoint, recursion-safe.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatTracepointStats {
    pub tracepoint: Tracepoint,
    pub call_count: u64,
    pub wall_time: Duration,
    pub max_wall_time: Duration,
}

/// Walks `tree` depth-first, folding every node's measurements into its
/// tracepoint's running total. `callCount` is added for every visited node;
/// `wallTime`/`maxWallTime` are added only when the tracepoint is not
/// already on the path from the root to this node, so self- and
/// mutual-recursion are counted once rather than once per stack frame.
/// The synthetic root is excluded from the result.
pub fn compute_flat_tracepoint_stats(tree: &CallTree) -> Vec<FlatTracepointStats> {
    let mut totals: Vec<FlatTracepointStats> = Vec::new();
    let mut index_of: std::collections::HashMap<Tracepoint, usize> = std::collections::HashMap::new();
    let mut ancestors: HashSet<Tracepoint> = HashSet::new();

    visit(tree, 0, &mut ancestors, &mut totals, &mut index_of);

    totals
}

fn visit(
    tree: &CallTree,
    node_idx: usize,
    ancestors: &mut HashSet<Tracepoint>,
    totals: &mut Vec<FlatTracepointStats>,
    index_of: &mut std::collections::HashMap<Tracepoint, usize>,
) {
    let node = tree.node(node_idx);
    let is_root = matches!(node.tracepoint(), Tracepoint::Root);

    if !is_root {
        let already_on_stack = ancestors.contains(node.tracepoint());
        let idx = *index_of.entry(node.tracepoint().clone()).or_insert_with(|| {
            totals.push(FlatTracepointStats {
                tracepoint: node.tracepoint().clone(),
                call_count: 0,
                wall_time: Duration::ZERO,
                max_wall_time: Duration::ZERO,
            });
            totals.len() - 1
        });

        totals[idx].call_count += node.call_count();
        if !already_on_stack {
            totals[idx].wall_time += node.wall_time();
            totals[idx].max_wall_time = totals[idx].max_wall_time.max(node.max_wall_time());
        }
    }

    let inserted = !is_root && ancestors.insert(node.tracepoint().clone());
    for (_, child_idx) in node.children() {
        visit(tree, child_idx, ancestors, totals, index_of);
    }
    if inserted {
        ancestors.remove(node.tracepoint());
    }
}

/// Fixed per-call overhead estimate, for display only: an arg-stamped
/// call pays more than a plain one because it also allocates and
/// stringifies captured arguments.
const PLAIN_CALL_OVERHEAD_NS: u64 = 40;
const ARG_STAMPED_CALL_OVERHEAD_NS: u64 = 150;

/// Sums a fixed per-call constant over every node of `tree`, higher for
/// arg-stamped tracepoints, as a rough display-only estimate of how much of
/// the measured wall time is tracing overhead rather than the traced code
/// itself.
pub fn estimate_tracing_overhead(tree: &CallTree) -> Duration {
    let mut total_ns: u64 = 0;
    estimate_from(tree, 0, &mut total_ns);
    Duration::from_nanos(total_ns)
}

fn estimate_from(tree: &CallTree, node_idx: usize, total_ns: &mut u64) {
    let node = tree.node(node_idx);
    let per_call = match node.tracepoint() {
        Tracepoint::Root => 0,
        Tracepoint::Method(_) => PLAIN_CALL_OVERHEAD_NS,
        Tracepoint::MethodWithArgs(_, _) => ARG_STAMPED_CALL_OVERHEAD_NS,
    };
    *total_ns = total_ns.saturating_add(per_call.saturating_mul(node.call_count()));
    for (_, child_idx) in node.children() {
        estimate_from(tree, child_idx, total_ns);
    }
}
