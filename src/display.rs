//! Text rendering of a call tree and its flat statistics, in a
//! box-drawing style a terminal or log file can render directly -- a
//! concrete [`crate::host::ViewHandle`] is free to use these renderers,
//! or bring its own.

use core::fmt;

use crate::aggregate::FlatTracepointStats;
use crate::call_tree::{CallTree, CallTreeNode};

/// Renders `tree` as an indented call tree: one line per node, with
/// call count / wall time / max wall time columns followed by the
/// tree-shaped connector and the tracepoint's display name.
pub struct DisplayableCallTree<'a> {
    pub tree: &'a CallTree,
    pub left_margin: usize,
}

impl<'a> fmt::Display for DisplayableCallTree<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:indent$}    # calls │    ∑ wall ms │     max ms │ call tree",
            "",
            indent = self.left_margin
        )?;
        writeln!(
            f,
            "{:indent$}────────────┼──────────────┼────────────┼───────────────────────",
            "",
            indent = self.left_margin
        )?;
        let mut last = Vec::new();
        for (_, child_idx) in self.tree.root().children() {
            last.push(is_last_child(self.tree.root(), child_idx));
            self.fmt_node(&mut last, self.tree.node(child_idx), f)?;
            last.pop();
        }
        Ok(())
    }
}

fn is_last_child(parent: &CallTreeNode, child_idx: usize) -> bool {
    parent
        .children()
        .last()
        .map(|(_, idx)| idx == child_idx)
        .unwrap_or(true)
}

impl<'a> DisplayableCallTree<'a> {
    fn fmt_node(&self, last: &mut Vec<bool>, node: &CallTreeNode, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:indent$}{: >7} {:0>3} ┊ {: >8}.{:0>3} ┊ {: >6}.{:0>3} ┊ ",
            "",
            node.call_count() / 1000,
            node.call_count() % 1000,
            node.wall_time().as_micros() / 1000,
            node.wall_time().as_micros() % 1000,
            node.max_wall_time().as_micros() / 1000,
            node.max_wall_time().as_micros() % 1000,
            indent = self.left_margin
        )?;

        let child_connector = if node.children().next().is_none() { "─" } else { "┬" };

        if last.len() == 1 {
            writeln!(f, "{} {}", child_connector, node.tracepoint().display_name())?;
        } else {
            for is_last in last.iter().take(last.len() - 1) {
                f.write_str(if *is_last { " " } else { "┊" })?;
            }
            let connect_me = if *last.last().unwrap() { "╰" } else { "├" };
            f.write_str(connect_me)?;
            f.write_str(child_connector)?;
            writeln!(f, " {}", node.tracepoint().display_name())?;
        }

        for (_, child_idx) in node.children() {
            last.push(is_last_child(node, child_idx));
            self.fmt_node(last, self.tree.node(child_idx), f)?;
            last.pop();
        }
        Ok(())
    }
}

/// Renders the flat per-tracepoint stats table, sorted by descending
/// wall time so the most expensive tracepoints lead.
pub struct DisplayableFlatStats<'a> {
    pub stats: &'a [FlatTracepointStats],
}

impl<'a> fmt::Display for DisplayableFlatStats<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "    # calls │    ∑ wall ms │     max ms │ tracepoint")?;
        writeln!(f, "────────────┼──────────────┼────────────┼───────────────────────")?;

        let mut sorted: Vec<&FlatTracepointStats> = self.stats.iter().collect();
        sorted.sort_by(|a, b| b.wall_time.cmp(&a.wall_time));

        for stat in sorted {
            writeln!(
                f,
                "{: >7} {:0>3} ┊ {: >8}.{:0>3} ┊ {: >6}.{:0>3} ┊ {}",
                stat.call_count / 1000,
                stat.call_count % 1000,
                stat.wall_time.as_micros() / 1000,
                stat.wall_time.as_micros() % 1000,
                stat.max_wall_time.as_micros() / 1000,
                stat.max_wall_time.as_micros() % 1000,
                stat.tracepoint.display_name(),
            )?;
        }
        Ok(())
    }
}
