//! Traversal algorithms and the query surface of a performance tree.
//!
//! Visitors receive `(node, depth)` with the virtual root at depth 0 and
//! return [`Visit`] to continue or short-circuit.

use std::collections::VecDeque;
use std::sync::Arc;

use super::tree::{PerformanceTree, TreeNode, Visit, ROOT_FUNCTION};

/// Depth-first pre-order traversal.
pub fn preorder(root: &Arc<TreeNode>, visitor: &mut impl FnMut(&Arc<TreeNode>, usize) -> Visit) {
    preorder_impl(root, 0, visitor);
}

fn preorder_impl(
    node: &Arc<TreeNode>,
    depth: usize,
    visitor: &mut impl FnMut(&Arc<TreeNode>, usize) -> Visit,
) -> Visit {
    if visitor(node, depth) == Visit::Stop {
        return Visit::Stop;
    }
    for child in node.children() {
        if preorder_impl(&child, depth + 1, visitor) == Visit::Stop {
            return Visit::Stop;
        }
    }
    Visit::Continue
}

/// Depth-first post-order traversal.
pub fn postorder(root: &Arc<TreeNode>, visitor: &mut impl FnMut(&Arc<TreeNode>, usize) -> Visit) {
    postorder_impl(root, 0, visitor);
}

fn postorder_impl(
    node: &Arc<TreeNode>,
    depth: usize,
    visitor: &mut impl FnMut(&Arc<TreeNode>, usize) -> Visit,
) -> Visit {
    for child in node.children() {
        if postorder_impl(&child, depth + 1, visitor) == Visit::Stop {
            return Visit::Stop;
        }
    }
    visitor(node, depth)
}

/// Breadth-first (level-order) traversal.
pub fn level_order(root: &Arc<TreeNode>, visitor: &mut impl FnMut(&Arc<TreeNode>, usize) -> Visit) {
    let mut queue = VecDeque::new();
    queue.push_back((Arc::clone(root), 0));
    while let Some((node, depth)) = queue.pop_front() {
        if visitor(&node, depth) == Visit::Stop {
            return;
        }
        for child in node.children() {
            queue.push_back((child, depth + 1));
        }
    }
}

impl PerformanceTree {
    /// Number of nodes including the virtual root.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        preorder(self.root(), &mut |_, _| {
            count += 1;
            Visit::Continue
        });
        count
    }

    /// Longest root-to-leaf distance; 0 for an empty tree.
    pub fn max_depth(&self) -> usize {
        let mut max = 0;
        preorder(self.root(), &mut |_, depth| {
            max = max.max(depth);
            Visit::Continue
        });
        max
    }

    /// Every real node (the virtual root is excluded), pre-order.
    pub fn all_nodes(&self) -> Vec<Arc<TreeNode>> {
        self.collect(|_| true)
    }

    pub fn leaf_nodes(&self) -> Vec<Arc<TreeNode>> {
        self.collect(|node| node.is_leaf())
    }

    /// Real nodes at `depth` (the virtual root is depth 0).
    pub fn nodes_at_depth(&self, depth: usize) -> Vec<Arc<TreeNode>> {
        let mut result = Vec::new();
        if depth == 0 {
            return result;
        }
        level_order(self.root(), &mut |node, d| {
            if d == depth {
                result.push(Arc::clone(node));
            }
            Visit::Continue
        });
        result
    }

    pub fn find_nodes_by_name(&self, function_name: &str) -> Vec<Arc<TreeNode>> {
        self.collect(|node| node.frame().function_name == function_name)
    }

    pub fn find_nodes_by_library(&self, library_name: &str) -> Vec<Arc<TreeNode>> {
        self.collect(|node| node.frame().library_name == library_name)
    }

    /// Real nodes with at least `min_samples` total samples.
    pub fn filter_by_samples(&self, min_samples: u64) -> Vec<Arc<TreeNode>> {
        self.collect(|node| node.total_samples() >= min_samples)
    }

    fn collect(&self, predicate: impl Fn(&Arc<TreeNode>) -> bool) -> Vec<Arc<TreeNode>> {
        let mut result = Vec::new();
        preorder(self.root(), &mut |node, depth| {
            if depth > 0 && node.frame().function_name != ROOT_FUNCTION && predicate(node) {
                result.push(Arc::clone(node));
            }
            Visit::Continue
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::resolve::ResolvedFrame;
    use crate::analysis::tree::{BuildMode, Concurrency, CountMode};

    fn frame(function: &str, library: &str, offset: u64) -> ResolvedFrame {
        ResolvedFrame {
            raw_address: offset,
            library_name: library.to_string(),
            offset,
            function_name: function.to_string(),
            ..ResolvedFrame::default()
        }
    }

    // root -> main -> {alpha -> leaf_a, beta}
    fn sample_tree() -> PerformanceTree {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        tree.insert_call_stack(
            &[
                frame("leaf_a", "app", 0x3000),
                frame("alpha", "app", 0x2000),
                frame("main", "app", 0x1000),
            ],
            0,
            10,
            0.0,
        );
        tree.insert_call_stack(
            &[frame("beta", "libx", 0x4000), frame("main", "app", 0x1000)],
            0,
            4,
            0.0,
        );
        tree
    }

    #[test]
    fn node_and_depth_counts() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.max_depth(), 3);
        assert_eq!(tree.all_nodes().len(), 4);
    }

    #[test]
    fn preorder_visits_parents_before_children() {
        let tree = sample_tree();
        let mut names = Vec::new();
        preorder(tree.root(), &mut |node, _| {
            names.push(node.frame().function_name.clone());
            Visit::Continue
        });
        let main_at = names.iter().position(|n| n == "main").unwrap();
        let leaf_at = names.iter().position(|n| n == "leaf_a").unwrap();
        assert_eq!(names[0], "[root]");
        assert!(main_at < leaf_at);
    }

    #[test]
    fn postorder_visits_children_before_parents() {
        let tree = sample_tree();
        let mut names = Vec::new();
        postorder(tree.root(), &mut |node, _| {
            names.push(node.frame().function_name.clone());
            Visit::Continue
        });
        assert_eq!(names.last().unwrap(), "[root]");
        let main_at = names.iter().position(|n| n == "main").unwrap();
        let leaf_at = names.iter().position(|n| n == "leaf_a").unwrap();
        assert!(leaf_at < main_at);
    }

    #[test]
    fn level_order_visits_by_depth() {
        let tree = sample_tree();
        let mut depths = Vec::new();
        level_order(tree.root(), &mut |_, depth| {
            depths.push(depth);
            Visit::Continue
        });
        let mut sorted = depths.clone();
        sorted.sort();
        assert_eq!(depths, sorted);
    }

    #[test]
    fn visitor_stop_short_circuits() {
        let tree = sample_tree();
        let mut visited = 0;
        preorder(tree.root(), &mut |_, _| {
            visited += 1;
            Visit::Stop
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn leaves_and_depth_slices() {
        let tree = sample_tree();
        let mut leaves: Vec<String> = tree
            .leaf_nodes()
            .iter()
            .map(|n| n.frame().function_name.clone())
            .collect();
        leaves.sort();
        assert_eq!(leaves, vec!["beta", "leaf_a"]);

        let level2: Vec<String> = tree
            .nodes_at_depth(2)
            .iter()
            .map(|n| n.frame().function_name.clone())
            .collect();
        assert_eq!(level2.len(), 2);
        assert!(level2.contains(&"alpha".to_string()));
        assert!(level2.contains(&"beta".to_string()));
        assert!(tree.nodes_at_depth(0).is_empty());
    }

    #[test]
    fn find_and_filter() {
        let tree = sample_tree();
        assert_eq!(tree.find_nodes_by_name("main").len(), 1);
        assert_eq!(tree.find_nodes_by_name("missing").len(), 0);
        assert_eq!(tree.find_nodes_by_library("libx").len(), 1);
        // main=14, alpha=10, leaf_a=10, beta=4
        assert_eq!(tree.filter_by_samples(10).len(), 3);
        assert_eq!(tree.filter_by_samples(15).len(), 0);
    }
}
