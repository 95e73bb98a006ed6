//! Per-thread call tree builder.

use std::time::Duration;

use indexmap::IndexMap;
use quanta::Clock;

use crate::tracepoint::Tracepoint;

/// Wall-clock source for a builder, with an overhead-refund discipline:
/// [`OverheadAdjustedClock::subtract_overhead`]
/// permanently shifts every later [`OverheadAdjustedClock::sample`] back by
/// the given amount, so that time a thread spent waiting on the builder
/// lock for another thread's snapshot never shows up as "work" done by the
/// traced method.
///
/// Readings are tracked as nanoseconds elapsed since construction rather
/// than raw `quanta::Instant`s, so the overhead refund is just integer
/// subtraction instead of requiring checked `Instant` arithmetic.
pub struct OverheadAdjustedClock {
    clock: Clock,
    epoch: quanta::Instant,
    overhead_ns: u64,
}

impl OverheadAdjustedClock {
    pub fn new(clock: Clock) -> Self {
        let epoch = clock.now();
        OverheadAdjustedClock {
            clock,
            epoch,
            overhead_ns: 0,
        }
    }

    /// A monotonically non-decreasing logical timestamp, in nanoseconds,
    /// already adjusted for all overhead refunded so far.
    pub fn sample(&self) -> u64 {
        let elapsed = self.clock.now().duration_since(self.epoch).as_nanos() as u64;
        elapsed.saturating_sub(self.overhead_ns)
    }

    pub fn subtract_overhead(&mut self, overhead: Duration) {
        self.overhead_ns = self.overhead_ns.saturating_add(overhead.as_nanos() as u64);
    }
}

/// Transient, per-push bookkeeping for a node currently on the open call
/// stack. Never observable outside this module -- a snapshot only ever
/// sees folded-in totals.
#[derive(Debug, Clone, Copy)]
struct OpenTiming {
    start: u64,
    continue_from: u64,
}

/// One node of a call tree: `tracepoint`, owning parent link, measurements,
/// and an insertion-ordered map from child tracepoint to child node.
#[derive(Debug, Clone)]
pub struct CallTreeNode {
    tracepoint: Tracepoint,
    parent: Option<usize>,
    call_count: u64,
    wall_time: Duration,
    max_wall_time: Duration,
    children: IndexMap<Tracepoint, usize>,
    open: Option<OpenTiming>,
}

impl CallTreeNode {
    fn new(tracepoint: Tracepoint, parent: Option<usize>) -> Self {
        CallTreeNode {
            tracepoint,
            parent,
            call_count: 0,
            wall_time: Duration::ZERO,
            max_wall_time: Duration::ZERO,
            children: IndexMap::new(),
            open: None,
        }
    }

    pub fn tracepoint(&self) -> &Tracepoint {
        &self.tracepoint
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }

    pub fn max_wall_time(&self) -> Duration {
        self.max_wall_time
    }

    /// Children in insertion order: `(tracepoint, node index)`.
    pub fn children(&self) -> impl Iterator<Item = (&Tracepoint, usize)> {
        self.children.iter().map(|(tp, &idx)| (tp, idx))
    }
}

/// A rooted call tree: an arena of [`CallTreeNode`]s, index 0 always being
/// the synthetic root -- the only node with no parent.
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
}

impl Default for CallTree {
    fn default() -> Self {
        CallTree {
            nodes: vec![CallTreeNode::new(Tracepoint::Root, None)],
        }
    }
}

impl CallTree {
    pub fn root(&self) -> &CallTreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> &CallTreeNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Finds or inserts a child of `parent_idx` for `tracepoint`, returning
    /// its index and whether it was freshly created.
    fn get_or_insert_child(&mut self, parent_idx: usize, tracepoint: &Tracepoint) -> (usize, bool) {
        if let Some(&idx) = self.nodes[parent_idx].children.get(tracepoint) {
            return (idx, false);
        }
        let idx = self.nodes.len();
        self.nodes.push(CallTreeNode::new(tracepoint.clone(), Some(parent_idx)));
        self.nodes[parent_idx].children.insert(tracepoint.clone(), idx);
        (idx, true)
    }

    /// Merges `other`'s subtree rooted at `other_idx` into `self` under
    /// `self_parent_idx`, accumulating counts/times and recursing into
    /// children. Used by [`crate::manager::CallTreeManager`] to build a
    /// freshly allocated merged tree out of several per-thread trees.
    pub fn merge_whole_tree(&mut self, other: &CallTree) {
        self.merge_from(0, other, 0);
    }

    fn merge_from(&mut self, self_parent_idx: usize, other: &CallTree, other_idx: usize) {
        let other_node = &other.nodes[other_idx];
        let (self_idx, _) = if self_parent_idx == 0 && other_idx == 0 {
            (0, false)
        } else {
            self.get_or_insert_child(self_parent_idx, &other_node.tracepoint)
        };
        {
            let node = &mut self.nodes[self_idx];
            node.call_count += other_node.call_count;
            node.wall_time += other_node.wall_time;
            node.max_wall_time = node.max_wall_time.max(other_node.max_wall_time);
        }
        for (_, other_child_idx) in other_node.children() {
            self.merge_from(self_idx, other, other_child_idx);
        }
    }
}

/// Per-thread state machine turning push/pop events into a call tree.
/// All methods here assume they are only ever called by
/// the single thread that owns this builder, except [`borrow_up_to_date_tree`]
/// and [`clear`], which are called by whichever thread currently holds the
/// builder's lock (the owning thread itself, or a reader taking a
/// snapshot).
///
/// [`borrow_up_to_date_tree`]: CallTreeBuilder::borrow_up_to_date_tree
/// [`clear`]: CallTreeBuilder::clear
pub struct CallTreeBuilder {
    tree: CallTree,
    current: usize,
    clock: OverheadAdjustedClock,
    max_call_depth: usize,
    /// Number of pushes past `max_call_depth` that were folded into
    /// `current` instead of creating a new node. The matching `pop` for
    /// each of those must no-op rather than pop a real frame -- tracked as
    /// a plain counter since folded frames never touch `current`, so
    /// unwinding them in any order is sound as long as the count matches.
    collapsed_depth: usize,
}

impl CallTreeBuilder {
    pub fn new(clock: Clock, max_call_depth: usize) -> Self {
        CallTreeBuilder {
            tree: CallTree::default(),
            current: 0,
            clock: OverheadAdjustedClock::new(clock),
            max_call_depth: max_call_depth.max(2),
            collapsed_depth: 0,
        }
    }

    fn depth_of(&self, idx: usize) -> usize {
        let mut depth = 0;
        let mut cur = idx;
        while let Some(parent) = self.tree.nodes[cur].parent {
            depth += 1;
            cur = parent;
        }
        depth
    }

    /// Pushes a call to `tracepoint` beneath the current node, creating a
    /// new child node on first occurrence and reusing it otherwise.
    /// Calls beyond `max_call_depth` are recorded as if
    /// inlined into the deepest kept ancestor -- they still increment that
    /// ancestor's `call_count` so no call is silently dropped, but no new
    /// node is created for them.
    pub fn push(&mut self, tracepoint: Tracepoint) {
        if self.depth_of(self.current) + 1 >= self.max_call_depth {
            self.tree.nodes[self.current].call_count += 1;
            self.collapsed_depth += 1;
            return;
        }

        let (child_idx, _) = self.tree.get_or_insert_child(self.current, &tracepoint);
        self.tree.nodes[child_idx].call_count += 1;

        if tracepoint.measures_wall_time() {
            let now = self.clock.sample();
            self.tree.nodes[child_idx].open = Some(OpenTiming {
                start: now,
                continue_from: now,
            });
        } else {
            self.tree.nodes[child_idx].open = None;
        }

        self.current = child_idx;
    }

    /// Pops the current node back to its parent, folding measured time
    /// into `wall_time`/`max_wall_time`. Popping the root is a fatal
    /// invariant violation: the builder must not silently recover, so
    /// this panics rather than clamping or no-opping.
    pub fn pop(&mut self) {
        if self.collapsed_depth > 0 {
            self.collapsed_depth -= 1;
            return;
        }

        let child_idx = self.current;
        let parent_idx = self.tree.nodes[child_idx]
            .parent
            .unwrap_or_else(|| panic!("call tree invariant violation: attempted to pop the root"));

        if let Some(open) = self.tree.nodes[child_idx].open.take() {
            let now = self.clock.sample();
            let node = &mut self.tree.nodes[child_idx];
            node.wall_time += Duration::from_nanos(now.saturating_sub(open.continue_from));
            node.max_wall_time = node
                .max_wall_time
                .max(Duration::from_nanos(now.saturating_sub(open.start)));
        }

        self.current = parent_idx;
    }

    pub fn subtract_overhead(&mut self, overhead: Duration) {
        self.clock.subtract_overhead(overhead);
    }

    /// Returns the up-to-date tree after "closing" the still-open stack:
    /// every node between the root and the current node gets its running
    /// totals folded in as of now, without actually popping anything, so
    /// tracing can continue uninterrupted.
    pub fn borrow_up_to_date_tree(&mut self) -> &CallTree {
        let now = self.clock.sample();
        let mut idx = self.current;
        while let Some(open) = self.tree.nodes[idx].open {
            let node = &mut self.tree.nodes[idx];
            node.wall_time += Duration::from_nanos(now.saturating_sub(open.continue_from));
            node.max_wall_time = node
                .max_wall_time
                .max(Duration::from_nanos(now.saturating_sub(open.start)));
            node.open = Some(OpenTiming {
                start: open.start,
                continue_from: now,
            });
            match self.tree.nodes[idx].parent {
                Some(parent) => idx = parent,
                None => break,
            }
        }
        &self.tree
    }

    /// Resets to an empty tree while preserving the currently-open call
    /// stack, so that in-flight calls keep being measured coherently after
    /// a reset: snapshot the chain of tracepoints
    /// from root to the current node, allocate a fresh tree, then replay
    /// `push` for each of those tracepoints.
    pub fn clear(&mut self) {
        let mut chain = Vec::new();
        let mut idx = self.current;
        while let Some(parent) = self.tree.nodes[idx].parent {
            chain.push(self.tree.nodes[idx].tracepoint.clone());
            idx = parent;
        }
        chain.reverse();

        self.tree = CallTree::default();
        self.current = 0;
        for tracepoint in chain {
            self.push(tracepoint);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fqname::MethodFqName;
    use crate::tracepoint::MethodTracepoint;
    use std::sync::Arc;

    fn method_tp(name: &str) -> Tracepoint {
        Tracepoint::Method(Arc::new(MethodTracepoint::new(MethodFqName::new(
            "com.example.Foo",
            name,
            "()V",
        ))))
    }

    fn builder_with_mock() -> (CallTreeBuilder, quanta::Mock) {
        let (clock, mock) = Clock::mock();
        (CallTreeBuilder::new(clock, 10), (*mock).clone())
    }

    #[test]
    fn simple_nesting_builds_expected_tree() {
        let (mut builder, mock) = builder_with_mock();
        let simple1 = method_tp("simple1");
        let simple2 = method_tp("simple2");
        let simple3 = method_tp("simple3");

        builder.push(simple1.clone());
        builder.push(simple2.clone());
        builder.push(simple3.clone());
        mock.increment(1);
        builder.pop(); // simple3
        builder.pop(); // simple2
        mock.increment(1);
        builder.pop(); // simple1

        let tree = builder.borrow_up_to_date_tree();
        let root = tree.root();
        assert_eq!(root.call_count(), 0);
        let (tp1, idx1) = root.children().next().unwrap();
        assert_eq!(tp1.display_name(), "simple1");
        let n1 = tree.node(idx1);
        assert_eq!(n1.call_count(), 1);
        assert_eq!(n1.wall_time(), Duration::from_nanos(2));

        let (_, idx2) = n1.children().next().unwrap();
        let n2 = tree.node(idx2);
        assert_eq!(n2.call_count(), 1);
        assert_eq!(n2.wall_time(), Duration::from_nanos(1));

        let (_, idx3) = n2.children().next().unwrap();
        let n3 = tree.node(idx3);
        assert_eq!(n3.call_count(), 1);
        assert_eq!(n3.wall_time(), Duration::from_nanos(1));
    }

    #[test]
    fn push_reuses_existing_child() {
        let (mut builder, _mock) = builder_with_mock();
        let a = method_tp("a");
        builder.push(a.clone());
        builder.pop();
        builder.push(a.clone());
        builder.pop();

        let tree = builder.borrow_up_to_date_tree();
        assert_eq!(tree.root().children().count(), 1);
        let (_, idx) = tree.root().children().next().unwrap();
        assert_eq!(tree.node(idx).call_count(), 2);
    }

    #[test]
    #[should_panic(expected = "attempted to pop the root")]
    fn pop_of_root_panics() {
        let (mut builder, _mock) = builder_with_mock();
        builder.pop();
    }

    #[test]
    fn clear_preserves_open_stack_shape_and_zeroes_measurements() {
        let (mut builder, mock) = builder_with_mock();
        let a = method_tp("a");
        let b = method_tp("b");
        builder.push(a.clone());
        mock.increment(5);
        builder.push(b.clone());
        mock.increment(5);

        builder.clear();

        let tree = builder.borrow_up_to_date_tree();
        let root = tree.root();
        assert_eq!(root.children().count(), 1);
        let (_, idx_a) = root.children().next().unwrap();
        let node_a = tree.node(idx_a);
        assert_eq!(node_a.call_count(), 1);
        assert_eq!(node_a.children().count(), 1);
        let (_, idx_b) = node_a.children().next().unwrap();
        let node_b = tree.node(idx_b);
        assert_eq!(node_b.call_count(), 1);
        // freshly replayed, no time has been attributed yet
        assert_eq!(node_a.wall_time(), Duration::ZERO);
        assert_eq!(node_b.wall_time(), Duration::ZERO);

        mock.increment(3);
        builder.pop();
        builder.pop();
        let tree = builder.borrow_up_to_date_tree();
        let (_, idx_a) = tree.root().children().next().unwrap();
        assert_eq!(tree.node(idx_a).wall_time(), Duration::from_nanos(3));
    }

    #[test]
    fn max_call_depth_caps_tree_growth() {
        let (mut builder, _mock) = builder_with_mock();
        let a = method_tp("a");
        for _ in 0..20 {
            builder.push(a.clone());
        }
        let tree = builder.borrow_up_to_date_tree();
        assert!(tree.len() < 20);
    }

    #[test]
    fn pops_past_max_call_depth_stay_paired_with_their_folded_pushes() {
        // Pushing past the cap must not desynchronize push/pop pairing:
        // every folded push's matching pop has to no-op rather than pop a
        // real frame that a shallower, still-open call is relying on.
        let (clock, _mock) = Clock::mock();
        let mut builder = CallTreeBuilder::new(clock, 3);
        let a = method_tp("a");

        builder.push(a.clone()); // depth 1, real
        builder.push(a.clone()); // depth 2, real
        builder.push(a.clone()); // depth 2+1 >= max_call_depth, folded
        builder.push(a.clone()); // folded
        builder.push(a.clone()); // folded

        for _ in 0..5 {
            builder.pop();
        }

        // All five pushes have a matching pop: the builder is back at the
        // root with nothing left open.
        let tree = builder.borrow_up_to_date_tree();
        assert_eq!(tree.root().children().count(), 1);
        let (_, idx1) = tree.root().children().next().unwrap();
        let depth1 = tree.node(idx1);
        assert_eq!(depth1.call_count(), 1);
        assert_eq!(depth1.children().count(), 1);

        let (_, idx2) = depth1.children().next().unwrap();
        let depth2 = tree.node(idx2);
        // The real depth-2 node plus the three folded calls beneath it all
        // landed on the same node, with no node created for the folded
        // calls themselves.
        assert_eq!(depth2.call_count(), 4);
        assert_eq!(depth2.children().count(), 0);

        // A subsequent, fresh push/pop at the root proves the stack
        // wasn't left off-balance by the folded region.
        builder.push(a.clone());
        builder.pop();
        let tree = builder.borrow_up_to_date_tree();
        assert_eq!(tree.root().children().count(), 1);
    }
}
