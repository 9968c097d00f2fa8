use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::codec;
use crate::error::CodecError;
use crate::sample::{CallStack, InternMap};

use super::resolve::AddressResolver;
use super::symbols::SymbolResolver;
use super::tree::{BuildMode, Concurrency, CountMode, PerformanceTree};

/// Outcome of ingesting one trace file.
#[derive(Debug)]
pub struct FileReadResult {
    pub path: PathBuf,
    pub process_id: u32,
    /// Distinct stacks ingested on success.
    pub result: Result<u64, CodecError>,
}

impl FileReadResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Builds a performance tree from trace and library-map files.
///
/// Per-file failures are recorded and logged but never abort the build; the
/// remaining files are still ingested. With
/// [`Concurrency::ThreadLocalMerge`] the file list is spread across a worker
/// pool, each worker folds into a private tree, and the private trees are
/// merged once the workers have joined.
pub struct TreeBuilder {
    resolver: AddressResolver,
    tree: PerformanceTree,
    resolve_symbols: bool,
    /// Estimated wall time represented by one sample.
    time_per_sample_us: f64,
    workers: usize,
}

impl TreeBuilder {
    pub fn new(build_mode: BuildMode, count_mode: CountMode, concurrency: Concurrency) -> Self {
        Self {
            resolver: AddressResolver::new(),
            tree: PerformanceTree::new(build_mode, count_mode, concurrency),
            resolve_symbols: false,
            time_per_sample_us: 1000.0,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }

    pub fn tree(&self) -> &PerformanceTree {
        &self.tree
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut AddressResolver {
        &mut self.resolver
    }

    /// Enables symbolization of resolved frames through `symbols`.
    pub fn with_symbols(mut self, symbols: SymbolResolver) -> Self {
        self.resolver.bind_symbols(symbols);
        self.resolve_symbols = true;
        self
    }

    pub fn set_time_per_sample_us(&mut self, time_us: f64) {
        self.time_per_sample_us = time_us;
    }

    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers.max(1);
    }

    /// Decodes library maps and registers them as snapshots keyed by the
    /// given process id. Returns how many loaded.
    pub fn load_library_maps(&mut self, files: &[(PathBuf, u32)]) -> usize {
        let mut loaded = 0;
        for (path, process_id) in files {
            match codec::read_libmap(path) {
                Ok((map, file_info)) => {
                    debug!(
                        "libmap {} for process {process_id}: {} regions",
                        path.display(),
                        file_info.regions_read
                    );
                    self.resolver.add_snapshot(*process_id, map);
                    loaded += 1;
                }
                Err(err) => warn!("skipping libmap {}: {err}", path.display()),
            }
        }
        loaded
    }

    /// Ingests sample traces and folds them into the tree.
    pub fn build_from_files(&mut self, files: &[(PathBuf, u32)]) -> Vec<FileReadResult> {
        let max_process = files.iter().map(|(_, pid)| *pid).max();
        if let Some(max) = max_process {
            self.tree.set_process_count(max as usize + 1);
        }

        let results = match self.tree.concurrency() {
            Concurrency::ThreadLocalMerge => self.build_parallel(files),
            _ => files
                .iter()
                .map(|(path, pid)| self.read_one(path, *pid, &self.tree))
                .collect(),
        };

        if self.tree.concurrency() == Concurrency::LockFree {
            self.tree.consolidate();
        }

        let ok = results.iter().filter(|r| r.is_ok()).count();
        info!(
            "built tree from {ok}/{} files: {} samples in {} nodes",
            results.len(),
            self.tree.total_samples(),
            self.tree.node_count()
        );
        results
    }

    fn build_parallel(&self, files: &[(PathBuf, u32)]) -> Vec<FileReadResult> {
        if files.is_empty() {
            return Vec::new();
        }
        let workers = self.workers.min(files.len());
        let chunk = files.len().div_ceil(workers);

        let mut outcomes: Vec<(Vec<FileReadResult>, PerformanceTree)> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = files
                    .chunks(chunk)
                    .map(|slice| {
                        let local = self.tree.new_local_tree();
                        scope.spawn(move || {
                            let results = slice
                                .iter()
                                .map(|(path, pid)| self.read_one(path, *pid, &local))
                                .collect::<Vec<_>>();
                            (results, local)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("tree worker panicked"))
                    .collect()
            });

        let mut results = Vec::with_capacity(files.len());
        for (worker_results, local) in &mut outcomes {
            self.tree.merge_local_tree(local);
            results.append(worker_results);
        }
        results
    }

    fn read_one(&self, path: &Path, process_id: u32, tree: &PerformanceTree) -> FileReadResult {
        let result = self.ingest(path, process_id, tree);
        if let Err(err) = &result {
            warn!("skipping trace {}: {err}", path.display());
        }
        FileReadResult {
            path: path.to_path_buf(),
            process_id,
            result,
        }
    }

    fn ingest(
        &self,
        path: &Path,
        process_id: u32,
        tree: &PerformanceTree,
    ) -> Result<u64, CodecError> {
        let header = codec::read_sample_header(path)?;
        // Twice the advertised entry count, bounded so a corrupt header
        // cannot force a huge allocation.
        let capacity = (header.entry_count as usize)
            .saturating_mul(2)
            .clamp(1024, 4 << 20);
        let map: InternMap<CallStack> = InternMap::new(capacity);
        let info = codec::read_samples_into(path, &map)?;
        if info.truncated {
            debug!("trace {} is truncated, ingesting prefix", path.display());
        }

        map.for_each(|stack, count| {
            let frames = self
                .resolver
                .convert(stack, process_id, self.resolve_symbols);
            let time_us = count as f64 * self.time_per_sample_us;
            tree.insert_call_stack(&frames, process_id as usize, count, time_us);
        });
        Ok(info.entries_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::resolve::UNRESOLVED_LIBRARY;
    use crate::sample::LibraryMap;

    fn write_trace(dir: &Path, rank: u32, stacks: &[(&[u64], u64)]) -> PathBuf {
        let map = InternMap::new(256);
        for (frames, count) in stacks {
            map.insert(&CallStack::from_frames(frames), *count);
        }
        let path = dir.join(format!("app_rank_{rank}.pflw"));
        codec::write_samples(&path, &map, 64, false).unwrap();
        path
    }

    fn write_libmap(dir: &Path, rank: u32) -> PathBuf {
        let mut map = LibraryMap::new();
        assert!(map.parse_from(
            "0000000000400000-0000000000500000 r-xp 00000000 08:01 1 /usr/bin/app\n"
        ));
        let path = dir.join(format!("app_rank_{rank}.libmap"));
        codec::write_libmap(&path, &map, rank).unwrap();
        path
    }

    #[test]
    fn builds_tree_from_two_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = write_trace(dir.path(), 0, &[(&[0x401000, 0x400100], 10)]);
        let t1 = write_trace(dir.path(), 1, &[(&[0x402000, 0x400100], 5)]);
        let m0 = write_libmap(dir.path(), 0);
        let m1 = write_libmap(dir.path(), 1);

        let mut builder = TreeBuilder::new(
            BuildMode::ContextAware,
            CountMode::Both,
            Concurrency::Serial,
        );
        assert_eq!(builder.load_library_maps(&[(m0, 0), (m1, 1)]), 2);
        let results = builder.build_from_files(&[(t0, 0), (t1, 1)]);
        assert!(results.iter().all(|r| r.is_ok()));

        let tree = builder.tree();
        assert_eq!(tree.process_count(), 2);
        assert_eq!(tree.total_samples(), 15);
        // Both stacks share the outer frame at offset 0x100.
        let outer = &tree.root().children()[0];
        assert_eq!(outer.frame().offset, 0x100);
        assert_eq!(outer.frame().library_name, "/usr/bin/app");
        assert_eq!(outer.child_count(), 2);
        assert_eq!(outer.count_for(0), 10);
        assert_eq!(outer.count_for(1), 5);
    }

    #[test]
    fn missing_libmap_still_builds_with_unresolved_frames() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = write_trace(dir.path(), 0, &[(&[0x1234], 3)]);

        let mut builder =
            TreeBuilder::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        let results = builder.build_from_files(&[(t0, 0)]);
        assert!(results[0].is_ok());
        let node = &builder.tree().root().children()[0];
        assert_eq!(node.frame().library_name, UNRESOLVED_LIBRARY);
        assert_eq!(node.frame().function_name, "0x1234");
    }

    #[test]
    fn per_file_failure_does_not_abort_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_trace(dir.path(), 0, &[(&[0x1000], 7)]);
        let missing = dir.path().join("app_rank_1.pflw");

        let mut builder =
            TreeBuilder::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        let results = builder.build_from_files(&[(missing, 1), (good, 0)]);
        assert!(!results[0].is_ok());
        assert!(matches!(results[0].result, Err(CodecError::FileOpen(_))));
        assert!(results[1].is_ok());
        assert_eq!(builder.tree().total_samples(), 7);
        // Rank 1 still reserved a process slot.
        assert_eq!(builder.tree().process_count(), 2);
    }

    #[test]
    fn thread_local_merge_matches_serial() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for rank in 0..4u32 {
            let addr = 0x1000 + rank as u64;
            files.push((
                write_trace(dir.path(), rank, &[(&[addr, 0x9000], 10 + rank as u64)]),
                rank,
            ));
        }

        let mut serial =
            TreeBuilder::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
        serial.build_from_files(&files);

        let mut merged = TreeBuilder::new(
            BuildMode::ContextFree,
            CountMode::Both,
            Concurrency::ThreadLocalMerge,
        );
        merged.set_workers(4);
        let results = merged.build_from_files(&files);
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(
            serial.tree().total_samples(),
            merged.tree().total_samples()
        );
        assert_eq!(serial.tree().node_count(), merged.tree().node_count());
        assert_eq!(
            serial.tree().root().process_counts(),
            merged.tree().root().process_counts()
        );
    }
}
