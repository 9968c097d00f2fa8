use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::analysis::{PerformanceTree, ResolvedFrame, TreeNode, ROOT_LIBRARY};
use crate::error::CodecError;

use super::{
    get_u16, get_u32, get_u64, header_with_prefix, now_unix, open_file, read_exact_or_eof,
    write_file, TREE_MAGIC,
};

const NODE_HEADER_LEN: usize = 64;

// Header layout after the shared prefix:
//   8..16  node_count
//  16..20  process_count
//  20..24  reserved
//  24..32  timestamp
//  32..64  reserved
//
// Nodes follow in depth-first order with ids assigned during the walk, each
// as a 64-byte node header, the three strings, then the per-process count
// and time arrays sized by the file's process count.
/// Persists a performance tree.
pub fn write_tree(path: &Path, tree: &PerformanceTree, compress: bool) -> Result<(), CodecError> {
    let process_count = tree.process_count();
    let mut payload = Vec::new();
    let mut next_id = 0u64;
    serialize_node(tree.root(), 0, &mut next_id, process_count, &mut payload);

    let mut header = header_with_prefix(TREE_MAGIC, super::COMPRESSION_NONE);
    header[8..16].copy_from_slice(&next_id.to_le_bytes());
    header[16..20].copy_from_slice(&(process_count as u32).to_le_bytes());
    header[24..32].copy_from_slice(&now_unix().to_le_bytes());

    write_file(path, header, &payload, compress)
}

fn serialize_node(
    node: &Arc<TreeNode>,
    parent_id: u64,
    next_id: &mut u64,
    process_count: usize,
    out: &mut Vec<u8>,
) {
    let node_id = *next_id;
    *next_id += 1;

    let frame = node.frame();
    let children = node.children();
    let function = truncated(&frame.function_name);
    let library = truncated(&frame.library_name);
    let filename = truncated(&frame.filename);

    out.extend_from_slice(&node_id.to_le_bytes());
    out.extend_from_slice(&parent_id.to_le_bytes());
    out.extend_from_slice(&node.total_samples().to_le_bytes());
    out.extend_from_slice(&node.self_samples().to_le_bytes());
    out.extend_from_slice(&frame.raw_address.to_le_bytes());
    out.extend_from_slice(&frame.offset.to_le_bytes());
    out.extend_from_slice(&frame.line_number.to_le_bytes());
    out.extend_from_slice(&(function.len() as u16).to_le_bytes());
    out.extend_from_slice(&(library.len() as u16).to_le_bytes());
    out.extend_from_slice(&(filename.len() as u16).to_le_bytes());
    out.extend_from_slice(&(children.len().min(u16::MAX as usize) as u16).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    out.extend_from_slice(function.as_bytes());
    out.extend_from_slice(library.as_bytes());
    out.extend_from_slice(filename.as_bytes());

    let counts = node.process_counts();
    let times = node.process_times_us();
    for pid in 0..process_count {
        out.extend_from_slice(&counts.get(pid).copied().unwrap_or(0).to_le_bytes());
    }
    for pid in 0..process_count {
        out.extend_from_slice(&times.get(pid).copied().unwrap_or(0.0).to_bits().to_le_bytes());
    }

    for child in &children {
        serialize_node(child, node_id, next_id, process_count, out);
    }
}

// String length fields are u16 on disk.
fn truncated(s: &str) -> &str {
    if s.len() <= u16::MAX as usize {
        s
    } else {
        let mut end = u16::MAX as usize;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

/// Reads a persisted tree back, attaching nodes to parents by id.
///
/// The decoded tree carries default build modes; modes are not part of the
/// file format.
pub fn read_tree(path: &Path) -> Result<PerformanceTree, CodecError> {
    let (header, mut payload) = open_file(path, TREE_MAGIC)?;
    let node_count = get_u64(&header, 8);
    let process_count = get_u32(&header, 16) as usize;

    if node_count == 0 {
        return Err(CodecError::integrity("tree file has no nodes"));
    }

    let mut nodes: Vec<Arc<TreeNode>> = Vec::with_capacity(node_count as usize);
    let mut node_header = [0u8; NODE_HEADER_LEN];

    for expected_id in 0..node_count {
        if !read_exact_or_eof(&mut payload, &mut node_header)? {
            // A tree truncated mid-write still yields its complete prefix,
            // unless nothing was read at all.
            break;
        }
        let node_id = get_u64(&node_header, 0);
        let parent_id = get_u64(&node_header, 8);
        let total = get_u64(&node_header, 16);
        let self_samples = get_u64(&node_header, 24);
        let raw_address = get_u64(&node_header, 32);
        let offset = get_u64(&node_header, 40);
        let line_number = get_u32(&node_header, 48);
        let fn_len = get_u16(&node_header, 52) as usize;
        let lib_len = get_u16(&node_header, 54) as usize;
        let file_len = get_u16(&node_header, 56) as usize;

        if node_id != expected_id {
            return Err(CodecError::integrity(format!(
                "node id {node_id} out of order, expected {expected_id}"
            )));
        }

        let mut strings = vec![0u8; fn_len + lib_len + file_len];
        if !read_exact_or_eof(&mut payload, &mut strings)? {
            break;
        }
        let text = |from: usize, len: usize| -> Result<String, CodecError> {
            String::from_utf8(strings[from..from + len].to_vec())
                .map_err(|_| CodecError::integrity("node string is not valid UTF-8"))
        };
        let frame = ResolvedFrame {
            raw_address,
            library_name: text(fn_len, lib_len)?,
            offset,
            function_name: text(0, fn_len)?,
            filename: text(fn_len + lib_len, file_len)?,
            line_number,
        };

        let mut counts = vec![0u64; process_count];
        let mut times = vec![0f64; process_count];
        let mut word = [0u8; 8];
        let mut complete = true;
        for slot in counts.iter_mut() {
            if !read_exact_or_eof(&mut payload, &mut word)? {
                complete = false;
                break;
            }
            *slot = u64::from_le_bytes(word);
        }
        if complete {
            for slot in times.iter_mut() {
                if !read_exact_or_eof(&mut payload, &mut word)? {
                    complete = false;
                    break;
                }
                *slot = f64::from_bits(u64::from_le_bytes(word));
            }
        }
        if !complete {
            break;
        }

        let node = if expected_id == 0 {
            TreeNode::detached(frame, process_count)
        } else {
            let parent = nodes.get(parent_id as usize).ok_or_else(|| {
                CodecError::integrity(format!("node {node_id} references unseen parent {parent_id}"))
            })?;
            TreeNode::attach_new_child(parent, frame, process_count)
        };
        node.restore_counters(&counts, &times, total, self_samples);
        nodes.push(node);
    }

    let root = nodes
        .first()
        .ok_or_else(|| CodecError::integrity("tree file has no decodable root"))?;
    Ok(PerformanceTree::from_root(Arc::clone(root), process_count))
}

/// Indented human-readable dump; informational only.
pub fn write_tree_text(path: &Path, tree: &PerformanceTree) -> Result<(), CodecError> {
    let file = File::create(path).map_err(CodecError::FileOpen)?;
    let mut out = BufWriter::new(file);

    writeln!(
        out,
        "# performance tree (text format)\n# generated: {}\n# processes: {}\n# total samples: {}\n#",
        now_unix(),
        tree.process_count(),
        tree.total_samples()
    )
    .map_err(CodecError::FileWrite)?;

    print_node(&mut out, tree.root(), 0).map_err(CodecError::FileWrite)?;
    out.flush().map_err(CodecError::FileWrite)
}

fn print_node(out: &mut impl Write, node: &Arc<TreeNode>, depth: usize) -> std::io::Result<()> {
    let frame = node.frame();
    write!(
        out,
        "{:indent$}[{} samples, {} self] {}",
        "",
        node.total_samples(),
        node.self_samples(),
        frame.function_name,
        indent = depth * 2
    )?;
    if !frame.library_name.is_empty() && frame.library_name != ROOT_LIBRARY {
        write!(out, " ({})", frame.library_name)?;
    }
    let location = frame.source_location();
    if !location.is_empty() {
        write!(out, " [{location}]")?;
    }
    writeln!(out)?;
    for child in node.children() {
        print_node(out, &child, depth + 1)?;
    }
    Ok(())
}
