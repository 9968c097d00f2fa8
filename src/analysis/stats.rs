//! Derived reports: workload balance across processes and hotspot ranking.

use std::sync::Arc;

use serde::Serialize;

use super::traverse::preorder;
use super::tree::{PerformanceTree, TreeNode, Visit};

/// Distribution of the root's per-process sample counts.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BalanceReport {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub least_loaded_process: usize,
    pub most_loaded_process: usize,
    /// `(max - min) / mean`, zero when the mean is zero.
    pub imbalance_factor: f64,
    pub process_samples: Vec<f64>,
}

/// Computes balance statistics over the tree's per-process counters.
pub fn analyze_balance(tree: &PerformanceTree) -> BalanceReport {
    let mut report = BalanceReport::default();
    let process_count = tree.process_count();
    if process_count == 0 {
        return report;
    }

    let counts = tree.root().process_counts();
    report.process_samples = (0..process_count)
        .map(|i| counts.get(i).copied().unwrap_or(0) as f64)
        .collect();

    let mut sum = 0.0;
    report.min = f64::MAX;
    report.max = 0.0;
    for (i, &count) in report.process_samples.iter().enumerate() {
        sum += count;
        if count < report.min {
            report.min = count;
            report.least_loaded_process = i;
        }
        if count > report.max {
            report.max = count;
            report.most_loaded_process = i;
        }
    }
    report.mean = sum / process_count as f64;

    let variance = report
        .process_samples
        .iter()
        .map(|c| {
            let d = c - report.mean;
            d * d
        })
        .sum::<f64>()
        / process_count as f64;
    report.std_dev = variance.sqrt();

    if report.mean > 0.0 {
        report.imbalance_factor = (report.max - report.min) / report.mean;
    }
    report
}

/// Ranking key for hotspot extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    Total,
    SelfSamples,
}

/// One ranked hotspot.
#[derive(Clone, Debug, Serialize)]
pub struct HotspotInfo {
    pub function_name: String,
    pub library_name: String,
    /// `file:line` when known, empty otherwise.
    pub source_location: String,
    pub total_samples: u64,
    pub percentage: f64,
    pub self_samples: u64,
    pub self_percentage: f64,
}

/// Returns the `top_n` hottest nodes, excluding the virtual root.
///
/// Ties break by depth (shallower first), then by insertion order.
pub fn top_hotspots(tree: &PerformanceTree, key: SortKey, top_n: usize) -> Vec<HotspotInfo> {
    let total = tree.total_samples();
    if total == 0 || top_n == 0 {
        return Vec::new();
    }

    let mut nodes: Vec<(Arc<TreeNode>, usize, usize)> = Vec::new();
    let mut seq = 0;
    preorder(tree.root(), &mut |node, depth| {
        if depth > 0 {
            nodes.push((Arc::clone(node), depth, seq));
            seq += 1;
        }
        Visit::Continue
    });

    let rank = |node: &Arc<TreeNode>| match key {
        SortKey::Total => node.total_samples(),
        SortKey::SelfSamples => node.self_samples(),
    };
    nodes.sort_by(|(a, ad, aseq), (b, bd, bseq)| {
        rank(b)
            .cmp(&rank(a))
            .then(ad.cmp(bd))
            .then(aseq.cmp(bseq))
    });

    nodes
        .iter()
        .take_while(|(node, _, _)| rank(node) > 0)
        .take(top_n)
        .map(|(node, _, _)| {
            let frame = node.frame();
            HotspotInfo {
                function_name: frame.function_name.clone(),
                library_name: frame.library_name.clone(),
                source_location: frame.source_location(),
                total_samples: node.total_samples(),
                percentage: node.total_samples() as f64 * 100.0 / total as f64,
                self_samples: node.self_samples(),
                self_percentage: node.self_samples() as f64 * 100.0 / total as f64,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::resolve::ResolvedFrame;
    use crate::analysis::tree::{BuildMode, Concurrency, CountMode};

    fn frame(function: &str, offset: u64) -> ResolvedFrame {
        ResolvedFrame {
            raw_address: offset,
            library_name: "app".to_string(),
            offset,
            function_name: function.to_string(),
            ..ResolvedFrame::default()
        }
    }

    fn leaf_stack(name: &str, offset: u64) -> Vec<ResolvedFrame> {
        vec![frame(name, offset), frame("main", 0x1000)]
    }

    #[test]
    fn balance_over_increasing_distribution() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        for (pid, count) in [50u64, 100, 150, 200].iter().enumerate() {
            tree.insert_call_stack(&leaf_stack("work", 0x2000), pid, *count, 0.0);
        }

        let report = analyze_balance(&tree);
        assert_eq!(report.mean, 125.0);
        assert_eq!(report.min, 50.0);
        assert_eq!(report.max, 200.0);
        assert_eq!(report.least_loaded_process, 0);
        assert_eq!(report.most_loaded_process, 3);
        assert!((report.imbalance_factor - 1.2).abs() < 1e-9);
        assert_eq!(report.process_samples, vec![50.0, 100.0, 150.0, 200.0]);
    }

    #[test]
    fn balance_of_uniform_workload_is_zero() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        for pid in 0..4 {
            tree.insert_call_stack(&leaf_stack("work", 0x2000), pid, 100, 0.0);
        }
        let report = analyze_balance(&tree);
        assert_eq!(report.imbalance_factor, 0.0);
        assert_eq!(report.std_dev, 0.0);
    }

    #[test]
    fn balance_of_empty_tree_is_all_zero() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        let report = analyze_balance(&tree);
        assert_eq!(report.mean, 0.0);
        assert_eq!(report.imbalance_factor, 0.0);
        assert!(report.process_samples.is_empty());
    }

    #[test]
    fn top_hotspots_by_self_in_descending_order() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        // 20 leaves with counts 100, 96, ..., 24.
        for i in 0..20u64 {
            let count = 100 - 4 * i;
            tree.insert_call_stack(&leaf_stack(&format!("fn_{i:02}"), 0x2000 + i), 0, count, 0.0);
        }

        let spots = top_hotspots(&tree, SortKey::SelfSamples, 5);
        assert_eq!(spots.len(), 5);
        assert_eq!(spots[0].function_name, "fn_00");
        assert_eq!(spots[0].self_samples, 100);
        for pair in spots.windows(2) {
            assert!(pair[0].self_samples >= pair[1].self_samples);
        }
    }

    #[test]
    fn hotspots_exclude_virtual_root_and_rank_by_total() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        tree.insert_call_stack(&leaf_stack("hot", 0x2000), 0, 90, 0.0);
        tree.insert_call_stack(&leaf_stack("cold", 0x3000), 0, 10, 0.0);

        let spots = top_hotspots(&tree, SortKey::Total, 10);
        assert!(spots.iter().all(|s| s.function_name != "[root]"));
        // main totals 100 and sits shallower than the leaves.
        assert_eq!(spots[0].function_name, "main");
        assert_eq!(spots[0].total_samples, 100);
        assert!((spots[0].percentage - 100.0).abs() < 1e-9);
        assert_eq!(spots[1].function_name, "hot");
        assert!((spots[1].percentage - 90.0).abs() < 1e-9);
    }

    #[test]
    fn ties_break_shallower_first() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        // main and its single leaf both total 50.
        tree.insert_call_stack(&leaf_stack("leaf", 0x2000), 0, 50, 0.0);
        let spots = top_hotspots(&tree, SortKey::Total, 2);
        assert_eq!(spots[0].function_name, "main");
        assert_eq!(spots[1].function_name, "leaf");
    }

    #[test]
    fn empty_tree_yields_no_hotspots() {
        let tree = PerformanceTree::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        assert!(top_hotspots(&tree, SortKey::Total, 5).is_empty());
    }
}
