use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::resolve::ResolvedFrame;

/// Child identity during insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Frames match on `(function, library)`; every call site of a function
    /// folds into one node.
    ContextFree,
    /// Frames additionally match on `offset`; distinct call sites stay
    /// distinct.
    ContextAware,
}

/// Which counters an insertion touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountMode {
    /// Only the leaf (and the virtual root, so the tree total stays
    /// well-defined) are counted; `self` equals the leaf count.
    Exclusive,
    /// Every node along the path is counted; `self` is not tracked.
    Inclusive,
    /// Every node along the path is counted and the leaf's `self` as well.
    Both,
}

/// Insertion concurrency strategy, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Concurrency {
    /// One tree-wide mutex around every mutating operation.
    Serial,
    /// Per-node child-list locks; counter updates are atomic fetch-adds.
    FineLock,
    /// Workers build private trees that are folded in after they join.
    ThreadLocalMerge,
    /// Optimistic child lookup, locking only to append; node totals are
    /// reconstructed by [`PerformanceTree::consolidate`] after the workers
    /// join.
    LockFree,
}

/// Traversal control returned by visitors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

pub const ROOT_FUNCTION: &str = "[root]";
pub const ROOT_LIBRARY: &str = "[virtual]";

struct PerProcess {
    counts: Vec<AtomicU64>,
    // f64 bit patterns; added with a CAS loop.
    times: Vec<AtomicU64>,
}

impl PerProcess {
    fn with_len(len: usize) -> Self {
        let mut this = Self {
            counts: Vec::new(),
            times: Vec::new(),
        };
        this.grow_to(len);
        this
    }

    fn grow_to(&mut self, len: usize) {
        if self.counts.len() < len {
            self.counts.resize_with(len, || AtomicU64::new(0));
            self.times.resize_with(len, || AtomicU64::new(0f64.to_bits()));
        }
    }
}

fn atomic_f64_add(cell: &AtomicU64, add: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + add).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// One vertex of a performance tree.
///
/// Nodes are owned by the tree through `Arc` child edges; parent edges are
/// weak and never extend a node's lifetime. The edge weight from the parent
/// (call count) lives on the child, since every node has exactly one parent.
pub struct TreeNode {
    frame: ResolvedFrame,
    per_process: RwLock<PerProcess>,
    total: AtomicU64,
    self_samples: AtomicU64,
    calls_from_parent: AtomicU64,
    children: RwLock<Vec<Arc<TreeNode>>>,
    parent: Weak<TreeNode>,
}

impl TreeNode {
    fn new(frame: ResolvedFrame, parent: Weak<TreeNode>, process_count: usize) -> Self {
        Self {
            frame,
            per_process: RwLock::new(PerProcess::with_len(process_count)),
            total: AtomicU64::new(0),
            self_samples: AtomicU64::new(0),
            calls_from_parent: AtomicU64::new(0),
            children: RwLock::new(Vec::new()),
            parent,
        }
    }

    pub(crate) fn detached(frame: ResolvedFrame, process_count: usize) -> Arc<Self> {
        Arc::new(Self::new(frame, Weak::new(), process_count))
    }

    /// Creates a child under `parent` and links it in. Caller is responsible
    /// for any locking discipline around the parent's child list.
    pub(crate) fn attach_new_child(
        parent: &Arc<TreeNode>,
        frame: ResolvedFrame,
        process_count: usize,
    ) -> Arc<TreeNode> {
        let child = Arc::new(Self::new(frame, Arc::downgrade(parent), process_count));
        parent
            .children
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&child));
        child
    }

    pub fn frame(&self) -> &ResolvedFrame {
        &self.frame
    }

    pub fn total_samples(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn self_samples(&self) -> u64 {
        self.self_samples.load(Ordering::Relaxed)
    }

    /// Calls recorded on the edge from this node's parent.
    pub fn call_count(&self) -> u64 {
        self.calls_from_parent.load(Ordering::Relaxed)
    }

    pub fn parent(&self) -> Option<Arc<TreeNode>> {
        self.parent.upgrade()
    }

    /// Snapshot of the child list.
    pub fn children(&self) -> Vec<Arc<TreeNode>> {
        self.children
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_leaf(&self) -> bool {
        self.child_count() == 0
    }

    /// Per-process sample counts, padded to the tracked process count.
    pub fn process_counts(&self) -> Vec<u64> {
        self.per_process
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Per-process accumulated time in microseconds.
    pub fn process_times_us(&self) -> Vec<f64> {
        self.per_process
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .times
            .iter()
            .map(|c| f64::from_bits(c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn count_for(&self, process_id: usize) -> u64 {
        self.per_process
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .counts
            .get(process_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn add_sample(&self, process_id: usize, count: u64, time_us: f64, bump_total: bool) {
        {
            let guard = self.per_process.read().unwrap_or_else(|e| e.into_inner());
            if process_id < guard.counts.len() {
                guard.counts[process_id].fetch_add(count, Ordering::Relaxed);
                atomic_f64_add(&guard.times[process_id], time_us);
                if bump_total {
                    self.total.fetch_add(count, Ordering::Relaxed);
                }
                return;
            }
        }
        let mut guard = self.per_process.write().unwrap_or_else(|e| e.into_inner());
        guard.grow_to(process_id + 1);
        guard.counts[process_id].fetch_add(count, Ordering::Relaxed);
        atomic_f64_add(&guard.times[process_id], time_us);
        if bump_total {
            self.total.fetch_add(count, Ordering::Relaxed);
        }
    }

    fn grow_processes(&self, len: usize) {
        self.per_process
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .grow_to(len);
    }

    pub(crate) fn restore_counters(
        &self,
        counts: &[u64],
        times_us: &[f64],
        total: u64,
        self_samples: u64,
    ) {
        let mut guard = self.per_process.write().unwrap_or_else(|e| e.into_inner());
        guard.grow_to(counts.len().max(times_us.len()));
        for (cell, v) in guard.counts.iter().zip(counts) {
            cell.store(*v, Ordering::Relaxed);
        }
        for (cell, v) in guard.times.iter().zip(times_us) {
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
        drop(guard);
        self.total.store(total, Ordering::Relaxed);
        self.self_samples.store(self_samples, Ordering::Relaxed);
    }

    pub(crate) fn add_call_count(&self, count: u64) {
        self.calls_from_parent.fetch_add(count, Ordering::Relaxed);
    }

    fn matches(&self, frame: &ResolvedFrame, mode: BuildMode) -> bool {
        let base = self.frame.function_name == frame.function_name
            && self.frame.library_name == frame.library_name;
        match mode {
            BuildMode::ContextFree => base,
            BuildMode::ContextAware => base && self.frame.offset == frame.offset,
        }
    }
}

fn root_frame() -> ResolvedFrame {
    ResolvedFrame {
        function_name: ROOT_FUNCTION.to_string(),
        library_name: ROOT_LIBRARY.to_string(),
        ..ResolvedFrame::default()
    }
}

/// Aggregating n-ary tree of resolved call stacks with per-process counters.
///
/// Build mode, count mode and concurrency model are fixed at construction.
/// Whatever the concurrency model, the tree observed after all inserts (and
/// [`consolidate`][Self::consolidate] for [`Concurrency::LockFree`]) equals
/// the one Serial would have produced from the same insertions, up to child
/// order.
pub struct PerformanceTree {
    root: Arc<TreeNode>,
    build_mode: BuildMode,
    count_mode: CountMode,
    concurrency: Concurrency,
    process_count: AtomicUsize,
    // Serial inserts, merges and clear all serialize on this.
    big_lock: Mutex<()>,
}

impl PerformanceTree {
    pub fn new(build_mode: BuildMode, count_mode: CountMode, concurrency: Concurrency) -> Self {
        Self {
            root: TreeNode::detached(root_frame(), 0),
            build_mode,
            count_mode,
            concurrency,
            process_count: AtomicUsize::new(0),
            big_lock: Mutex::new(()),
        }
    }

    pub(crate) fn from_root(root: Arc<TreeNode>, process_count: usize) -> Self {
        let tree = Self::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        let tree = Self { root, ..tree };
        tree.process_count.store(process_count, Ordering::Relaxed);
        tree
    }

    pub fn root(&self) -> &Arc<TreeNode> {
        &self.root
    }

    pub fn build_mode(&self) -> BuildMode {
        self.build_mode
    }

    pub fn count_mode(&self) -> CountMode {
        self.count_mode
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn process_count(&self) -> usize {
        self.process_count.load(Ordering::Relaxed)
    }

    /// Total samples in the tree; always the virtual root's `total`.
    pub fn total_samples(&self) -> u64 {
        self.root.total_samples()
    }

    /// Pre-sizes every node's per-process vectors.
    pub fn set_process_count(&self, count: usize) {
        self.process_count.fetch_max(count, Ordering::Relaxed);
        let len = self.process_count();
        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            node.grow_processes(len);
            stack.extend(node.children());
        }
    }

    /// Inserts one resolved stack, outermost frame first in `frames`'
    /// reverse order (frames are leaf-first as captured).
    pub fn insert_call_stack(
        &self,
        frames: &[ResolvedFrame],
        process_id: usize,
        count: u64,
        time_us: f64,
    ) {
        if frames.is_empty() {
            return;
        }
        if process_id >= self.process_count() {
            self.process_count
                .fetch_max(process_id + 1, Ordering::Relaxed);
        }
        match self.concurrency {
            Concurrency::Serial | Concurrency::ThreadLocalMerge => {
                let _guard = self.big_lock.lock().unwrap_or_else(|e| e.into_inner());
                self.insert_walk(frames, process_id, count, time_us);
            }
            Concurrency::FineLock | Concurrency::LockFree => {
                self.insert_walk(frames, process_id, count, time_us);
            }
        }
    }

    fn insert_walk(&self, frames: &[ResolvedFrame], process_id: usize, count: u64, time_us: f64) {
        let bump_total = self.concurrency != Concurrency::LockFree;

        // The virtual root is counted in every mode so the tree total and
        // the balance statistics stay well-defined.
        self.root.add_sample(process_id, count, time_us, bump_total);

        let mut current = Arc::clone(&self.root);
        let last = frames.len() - 1;
        // frames are leaf-first; walk outermost first.
        for (i, frame) in frames.iter().rev().enumerate() {
            let child = self.find_or_insert_child(&current, frame);
            child.add_call_count(count);

            let count_here = match self.count_mode {
                CountMode::Inclusive | CountMode::Both => true,
                CountMode::Exclusive => i == last,
            };
            if count_here {
                child.add_sample(process_id, count, time_us, bump_total);
            }
            current = child;
        }

        match self.count_mode {
            CountMode::Exclusive | CountMode::Both => {
                current.self_samples.fetch_add(count, Ordering::Relaxed);
            }
            CountMode::Inclusive => {}
        }
    }

    fn find_or_insert_child(&self, parent: &Arc<TreeNode>, frame: &ResolvedFrame) -> Arc<TreeNode> {
        if self.concurrency == Concurrency::LockFree {
            // Optimistic wait-light lookup; most inserts hit existing nodes.
            let children = parent.children.read().unwrap_or_else(|e| e.into_inner());
            if let Some(child) = children.iter().find(|c| c.matches(frame, self.build_mode)) {
                return Arc::clone(child);
            }
        }

        let mut children = parent.children.write().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = children.iter().find(|c| c.matches(frame, self.build_mode)) {
            return Arc::clone(child);
        }
        let child = Arc::new(TreeNode::new(
            frame.clone(),
            Arc::downgrade(parent),
            self.process_count(),
        ));
        children.push(Arc::clone(&child));
        child
    }

    /// A private tree for one worker thread; same modes, Serial insertion.
    pub fn new_local_tree(&self) -> PerformanceTree {
        let local = PerformanceTree::new(self.build_mode, self.count_mode, Concurrency::Serial);
        local
            .process_count
            .store(self.process_count(), Ordering::Relaxed);
        local
    }

    /// Folds a worker's private tree into this one. Only valid after the
    /// worker has stopped inserting into `local`.
    pub fn merge_local_tree(&self, local: &PerformanceTree) {
        let _guard = self.big_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.process_count
            .fetch_max(local.process_count(), Ordering::Relaxed);
        self.merge_node(&self.root, &local.root, true);
    }

    fn merge_node(&self, dst: &Arc<TreeNode>, src: &Arc<TreeNode>, is_root: bool) {
        let counts = src.process_counts();
        let times = src.process_times_us();
        for (pid, count) in counts.iter().enumerate() {
            let time = times.get(pid).copied().unwrap_or(0.0);
            if *count > 0 || time != 0.0 {
                dst.add_sample(pid, *count, time, true);
            }
        }
        let self_samples = src.self_samples();
        if self_samples > 0 {
            dst.self_samples.fetch_add(self_samples, Ordering::Relaxed);
        }
        if !is_root {
            dst.add_call_count(src.call_count());
        }

        for src_child in src.children() {
            let dst_child = self.find_or_insert_child(dst, src_child.frame());
            self.merge_node(&dst_child, &src_child, false);
        }
    }

    /// Rebuilds every node's `total` from its per-process counters.
    ///
    /// Required after a [`Concurrency::LockFree`] build, where totals are
    /// not maintained on the hot path; harmless under the other models.
    pub fn consolidate(&self) {
        let _guard = self.big_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            let sum: u64 = node.process_counts().iter().sum();
            node.total.store(sum, Ordering::Relaxed);
            stack.extend(node.children());
        }
    }

    /// Resets to an empty tree, keeping modes and process count.
    pub fn clear(&self) {
        let _guard = self.big_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.root
            .children
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.root.restore_counters(
            &vec![0; self.process_count()],
            &vec![0.0; self.process_count()],
            0,
            0,
        );
    }
}
