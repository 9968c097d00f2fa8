//! Post-mortem hotspot export.
//!
//! Usage: `analyzer <data_dir> <output_json> [num_ranks]`
//!
//! Folds every `<stem>_rank_<N>.pflw` / `.libmap` pair under `data_dir` into
//! one performance tree and writes hotspot and balance reports as JSON.
//! Exits 0 if any samples were ingested, 1 on argument errors or when no
//! samples were found.

use std::path::PathBuf;
use std::process::ExitCode;

use serde::Serialize;

use parprof::analysis::{
    analyze_balance, file_type_of, rank_from_path, top_hotspots, BalanceReport, BuildMode,
    Concurrency, CountMode, FileType, HotspotInfo, SortKey, SymbolResolver, SymbolStrategy,
    TreeBuilder,
};

#[derive(Serialize)]
struct Report {
    total_samples: u64,
    node_count: usize,
    trace_files: usize,
    balance: BalanceReport,
    hotspots_by_self: Vec<HotspotInfo>,
    hotspots_by_total: Vec<HotspotInfo>,
}

fn init_logging() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("SYMBOL_DEBUG").ok().as_deref() == Some("1") {
        builder.filter_module("parprof::analysis::symbols", log::LevelFilter::Debug);
    }
    builder.init();
}

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (data_dir, output_json, num_ranks) = match args.as_slice() {
        [data, out] => (PathBuf::from(data), PathBuf::from(out), None),
        [data, out, ranks] => match ranks.parse::<u32>() {
            Ok(n) => (PathBuf::from(data), PathBuf::from(out), Some(n)),
            Err(_) => {
                eprintln!("invalid rank count: {ranks}");
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("usage: analyzer <data_dir> <output_json> [num_ranks]");
            return ExitCode::FAILURE;
        }
    };

    let mut traces = Vec::new();
    let mut libmaps = Vec::new();
    match std::fs::read_dir(&data_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(rank) = rank_from_path(&path) else {
                    continue;
                };
                if num_ranks.is_some_and(|n| rank >= n) {
                    continue;
                }
                match file_type_of(&path) {
                    FileType::SampleData => traces.push((path, rank)),
                    FileType::LibraryMap => libmaps.push((path, rank)),
                    _ => {}
                }
            }
        }
        Err(err) => {
            eprintln!("cannot read {}: {err}", data_dir.display());
            return ExitCode::FAILURE;
        }
    }
    traces.sort();
    libmaps.sort();

    let mut builder = TreeBuilder::new(
        BuildMode::ContextFree,
        CountMode::Both,
        Concurrency::ThreadLocalMerge,
    )
    .with_symbols(SymbolResolver::new(SymbolStrategy::AutoFallback, true));

    builder.load_library_maps(&libmaps);
    let results = builder.build_from_files(&traces);
    for failed in results.iter().filter(|r| !r.is_ok()) {
        eprintln!(
            "warning: could not ingest {}: {:?}",
            failed.path.display(),
            failed.result
        );
    }

    let tree = builder.tree();
    if tree.total_samples() == 0 {
        eprintln!("no samples found under {}", data_dir.display());
        return ExitCode::FAILURE;
    }

    let report = Report {
        total_samples: tree.total_samples(),
        node_count: tree.node_count(),
        trace_files: results.iter().filter(|r| r.is_ok()).count(),
        balance: analyze_balance(tree),
        hotspots_by_self: top_hotspots(tree, SortKey::SelfSamples, 20),
        hotspots_by_total: top_hotspots(tree, SortKey::Total, 20),
    };

    let json = match serde_json::to_vec_pretty(&report) {
        Ok(json) => json,
        Err(err) => {
            eprintln!("cannot serialize report: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = std::fs::write(&output_json, json) {
        eprintln!("cannot write {}: {err}", output_json.display());
        return ExitCode::FAILURE;
    }

    println!(
        "{} samples over {} trace files -> {}",
        report.total_samples,
        report.trace_files,
        output_json.display()
    );
    ExitCode::SUCCESS
}
