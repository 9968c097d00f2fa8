//! Continuous monitoring of a directory ranks are flushing into.
//!
//! Usage: `online <data_dir> [output_dir]`
//!
//! Polls `data_dir` for new or grown traces and keeps `report.json` and
//! `current.ptree` up to date under `output_dir` (default
//! `<data_dir>/analysis`). Runs until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use parprof::analysis::{OnlineAnalyzer, OnlineOptions};

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
    let (data_dir, output_dir) = match args.as_slice() {
        [data] => {
            let data = PathBuf::from(data);
            let out = data.join("analysis");
            (data, out)
        }
        [data, out] => (PathBuf::from(data), PathBuf::from(out)),
        _ => {
            eprintln!("usage: online <data_dir> [output_dir]");
            return ExitCode::FAILURE;
        }
    };
    if !data_dir.is_dir() {
        eprintln!("not a directory: {}", data_dir.display());
        return ExitCode::FAILURE;
    }

    let options = OnlineOptions::default();
    let interval = options.poll_interval;
    let analyzer = OnlineAnalyzer::new(&data_dir, &output_dir, options);
    println!(
        "watching {} -> {}",
        data_dir.display(),
        output_dir.display()
    );

    loop {
        if let Some(report) = analyzer.poll() {
            println!(
                "rebuilt: {} samples, {} nodes, imbalance {:.2}",
                report.total_samples, report.node_count, report.balance.imbalance_factor
            );
            for (i, spot) in report.hotspots.iter().take(5).enumerate() {
                println!(
                    "  #{} {:>6.2}% {} ({})",
                    i + 1,
                    spot.self_percentage,
                    spot.function_name,
                    spot.library_name
                );
            }
        }
        std::thread::sleep(interval);
    }
}
