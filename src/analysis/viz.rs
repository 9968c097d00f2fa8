//! Graph-description (DOT) emission and PDF rendering through an external
//! `dot` invocation.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use log::debug;

use super::tree::{CountMode, PerformanceTree, TreeNode};

/// Node coloring strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorScheme {
    Grayscale,
    /// Blue over cyan, green and yellow to red with rising sample share.
    Heatmap,
    Rainbow,
}

/// Writes a DOT graph of the tree.
///
/// Node labels carry sample counts and shares; edges are labelled with call
/// counts. Exclusive-mode trees are colored by `self` samples, the other
/// modes by `total`. `max_depth` of 0 means unlimited.
pub fn write_dot(
    tree: &PerformanceTree,
    path: &Path,
    scheme: ColorScheme,
    max_depth: usize,
) -> io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    writeln!(out, "digraph PerformanceTree {{")?;
    writeln!(out, "  rankdir=TB;")?;
    writeln!(out, "  node [shape=box, style=filled];")?;
    writeln!(out, "  edge [arrowhead=vee];")?;
    writeln!(out)?;

    let by_self = tree.count_mode() == CountMode::Exclusive;
    let max_samples = tree.total_samples();
    let mut next_id = 0u64;
    emit_node(
        &mut out,
        tree.root(),
        &mut next_id,
        max_samples,
        scheme,
        by_self,
        0,
        max_depth,
    )?;

    writeln!(out, "}}")?;
    out.flush()
}

/// Renders the tree to PDF via GraphViz. Returns `false` when `dot` failed
/// or is not installed; the intermediate DOT file is removed either way.
pub fn render_pdf(
    tree: &PerformanceTree,
    pdf_path: &Path,
    scheme: ColorScheme,
    max_depth: usize,
) -> io::Result<bool> {
    let dot_path = pdf_path.with_extension("dot");
    write_dot(tree, &dot_path, scheme, max_depth)?;

    let status = Command::new("dot")
        .arg("-Tpdf")
        .arg(&dot_path)
        .arg("-o")
        .arg(pdf_path)
        .status();
    let ok = matches!(&status, Ok(s) if s.success());
    if !ok {
        debug!("dot invocation failed: {status:?}");
    }

    let _ = std::fs::remove_file(&dot_path);
    Ok(ok)
}

#[allow(clippy::too_many_arguments)]
fn emit_node(
    out: &mut impl Write,
    node: &Arc<TreeNode>,
    next_id: &mut u64,
    max_samples: u64,
    scheme: ColorScheme,
    by_self: bool,
    depth: usize,
    max_depth: usize,
) -> io::Result<()> {
    if max_depth > 0 && depth > max_depth {
        return Ok(());
    }
    let node_id = *next_id;
    *next_id += 1;

    let samples = if by_self {
        node.self_samples()
    } else {
        node.total_samples()
    };
    let share = if max_samples > 0 {
        samples as f64 * 100.0 / max_samples as f64
    } else {
        0.0
    };

    let mut label = node.frame().function_name.clone();
    if label.is_empty() {
        label = format!("{:#x}", node.frame().raw_address);
    }
    let label = label.replace('"', "\\\"");
    writeln!(
        out,
        "  node{node_id} [label=\"{label}\\n[{samples} samples, {share:.1}%]\", fillcolor=\"{}\"];",
        color(samples, max_samples, scheme)
    )?;

    for child in node.children() {
        if max_depth > 0 && depth + 1 > max_depth {
            break;
        }
        let child_id = *next_id;
        let calls = child.call_count();
        if calls > 0 {
            writeln!(out, "  node{node_id} -> node{child_id} [label=\"{calls}\"];")?;
        } else {
            writeln!(out, "  node{node_id} -> node{child_id};")?;
        }
        emit_node(
            out,
            &child,
            next_id,
            max_samples,
            scheme,
            by_self,
            depth + 1,
            max_depth,
        )?;
    }
    Ok(())
}

fn color(samples: u64, max_samples: u64, scheme: ColorScheme) -> String {
    if max_samples == 0 {
        return "white".to_string();
    }
    let ratio = (samples as f64 / max_samples as f64).clamp(0.0, 1.0);

    let (r, g, b) = match scheme {
        ColorScheme::Grayscale => {
            let gray = ((1.0 - ratio) * 255.0) as u8;
            (gray, gray, gray)
        }
        ColorScheme::Heatmap => heat(ratio),
        ColorScheme::Rainbow => {
            // Hue wheel from violet (cold) to red (hot).
            hsv_to_rgb(270.0 * (1.0 - ratio), 0.8, 1.0)
        }
    };
    format!("#{r:02x}{g:02x}{b:02x}")
}

// Quadrants: blue -> cyan -> green -> yellow -> red.
fn heat(ratio: f64) -> (u8, u8, u8) {
    let scale = |v: f64| (v.clamp(0.0, 1.0) * 255.0) as u8;
    if ratio < 0.25 {
        (0, scale(ratio * 4.0), 255)
    } else if ratio < 0.5 {
        (0, 255, scale(1.0 - (ratio - 0.25) * 4.0))
    } else if ratio < 0.75 {
        (scale((ratio - 0.5) * 4.0), 255, 0)
    } else {
        (255, scale(1.0 - (ratio - 0.75) * 4.0), 0)
    }
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h as u32 / 60 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}
