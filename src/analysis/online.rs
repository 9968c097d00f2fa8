//! Continuous analysis of a directory that ranks are still writing into.
//!
//! An [`OnlineAnalyzer`] composes the directory watcher with the tree
//! builder: every time a trace or library map appears or grows, the tree is
//! rebuilt from all known files and fresh reports land in the output
//! directory (`report.json`, `current.ptree`, `current.ptree.txt`).
//! Rebuilding from scratch keeps re-flushed files from being double
//! counted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::codec;

use super::builder::TreeBuilder;
use super::stats::{analyze_balance, top_hotspots, BalanceReport, HotspotInfo, SortKey};
use super::symbols::{SymbolResolver, SymbolStrategy};
use super::tree::{BuildMode, Concurrency, CountMode};
use super::watch::{rank_from_path, DirectoryWatcher, FileType};

#[derive(Clone, Debug)]
pub struct OnlineOptions {
    pub poll_interval: Duration,
    pub top_n: usize,
    pub resolve_symbols: bool,
    pub sort_key: SortKey,
}

impl Default for OnlineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            top_n: 20,
            resolve_symbols: true,
            sort_key: SortKey::SelfSamples,
        }
    }
}

/// Snapshot written after each rebuild.
#[derive(Clone, Debug, Serialize)]
pub struct OnlineReport {
    pub trace_files: usize,
    pub total_samples: u64,
    pub node_count: usize,
    pub balance: BalanceReport,
    pub hotspots: Vec<HotspotInfo>,
}

#[derive(Default)]
struct KnownFiles {
    samples: BTreeMap<PathBuf, u32>,
    libmaps: BTreeMap<PathBuf, u32>,
    dirty: bool,
}

/// Watches a data directory and keeps derived reports current.
pub struct OnlineAnalyzer {
    output_dir: PathBuf,
    options: OnlineOptions,
    files: Arc<Mutex<KnownFiles>>,
    watcher: Arc<DirectoryWatcher>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OnlineAnalyzer {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        options: OnlineOptions,
    ) -> Self {
        let files = Arc::new(Mutex::new(KnownFiles::default()));
        let sink = Arc::clone(&files);
        let watcher = DirectoryWatcher::new(
            data_dir,
            options.poll_interval,
            move |path, file_type, _is_new| {
                let Some(rank) = rank_from_path(path) else {
                    warn!("no rank in file name {}, ignoring", path.display());
                    return;
                };
                let mut known = sink.lock().unwrap_or_else(|e| e.into_inner());
                match file_type {
                    FileType::SampleData => {
                        known.samples.insert(path.to_path_buf(), rank);
                        known.dirty = true;
                    }
                    FileType::LibraryMap => {
                        known.libmaps.insert(path.to_path_buf(), rank);
                        known.dirty = true;
                    }
                    _ => {}
                }
            },
        );

        Self {
            output_dir: output_dir.into(),
            options,
            files,
            watcher: Arc::new(watcher),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.watcher.directory()
    }

    /// One scan-and-rebuild step. Returns the fresh report when anything
    /// changed since the last rebuild.
    pub fn poll(&self) -> Option<OnlineReport> {
        self.watcher.scan_once();
        self.rebuild_if_dirty()
    }

    /// Starts the background poll loop. Returns `false` when already
    /// running.
    pub fn start(&mut self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let watcher = Arc::clone(&self.watcher);
        let files = Arc::clone(&self.files);
        let running = Arc::clone(&self.running);
        let output_dir = self.output_dir.clone();
        let options = self.options.clone();
        self.thread = Some(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                watcher.scan_once();
                if let Some(report) = rebuild_if_dirty(&files, &output_dir, &options) {
                    info!(
                        "online rebuild: {} samples over {} trace files",
                        report.total_samples, report.trace_files
                    );
                }
                std::thread::sleep(options.poll_interval);
            }
        }));
        true
    }

    /// Stops the poll loop and joins its thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn rebuild_if_dirty(&self) -> Option<OnlineReport> {
        rebuild_if_dirty(&self.files, &self.output_dir, &self.options)
    }
}

impl Drop for OnlineAnalyzer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn rebuild_if_dirty(
    files: &Mutex<KnownFiles>,
    output_dir: &Path,
    options: &OnlineOptions,
) -> Option<OnlineReport> {
    let (samples, libmaps) = {
        let mut known = files.lock().unwrap_or_else(|e| e.into_inner());
        if !known.dirty {
            return None;
        }
        known.dirty = false;
        (
            known
                .samples
                .iter()
                .map(|(p, r)| (p.clone(), *r))
                .collect::<Vec<_>>(),
            known
                .libmaps
                .iter()
                .map(|(p, r)| (p.clone(), *r))
                .collect::<Vec<_>>(),
        )
    };
    if samples.is_empty() {
        return None;
    }

    let mut builder = TreeBuilder::new(
        BuildMode::ContextFree,
        CountMode::Both,
        Concurrency::ThreadLocalMerge,
    );
    if options.resolve_symbols {
        builder = builder.with_symbols(SymbolResolver::new(SymbolStrategy::AutoFallback, true));
    }
    builder.load_library_maps(&libmaps);
    let results = builder.build_from_files(&samples);
    for failed in results.iter().filter(|r| !r.is_ok()) {
        warn!("online ingest failed for {}", failed.path.display());
    }

    let tree = builder.tree();
    let report = OnlineReport {
        trace_files: results.iter().filter(|r| r.is_ok()).count(),
        total_samples: tree.total_samples(),
        node_count: tree.node_count(),
        balance: analyze_balance(tree),
        hotspots: top_hotspots(tree, options.sort_key, options.top_n),
    };

    if let Err(err) = std::fs::create_dir_all(output_dir) {
        warn!("cannot create {}: {err}", output_dir.display());
        return Some(report);
    }
    match serde_json::to_vec_pretty(&report) {
        Ok(json) => {
            if let Err(err) = std::fs::write(output_dir.join("report.json"), json) {
                warn!("cannot write report.json: {err}");
            }
        }
        Err(err) => warn!("cannot serialize report: {err}"),
    }
    if let Err(err) = codec::write_tree(&output_dir.join("current.ptree"), tree, false) {
        warn!("cannot write current.ptree: {err}");
    }
    if let Err(err) = codec::write_tree_text(&output_dir.join("current.ptree.txt"), tree) {
        warn!("cannot write current.ptree.txt: {err}");
    }

    Some(report)
}
