use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::CodecError;
use crate::sample::{CallStack, InternMap, MAX_STACK_DEPTH};

use super::{
    get_u32, get_u64, header_with_prefix, now_unix, open_file, read_exact_or_eof, write_file,
    SAMPLE_MAGIC,
};

/// Header fields and decode outcome of a sample trace.
#[derive(Clone, Copy, Debug)]
pub struct SampleFileInfo {
    pub entry_count: u64,
    pub max_stack_depth: u32,
    pub timestamp: u64,
    /// Entries actually decoded; less than `entry_count` when truncated.
    pub entries_read: u64,
    /// The file ended mid-entry, most likely because it is still being
    /// written.
    pub truncated: bool,
}

// Header layout after the shared prefix:
//   8..16  entry_count
//  16..20  max_stack_depth
//  20..24  reserved
//  24..32  timestamp
//  32..64  reserved
fn sample_header(entry_count: u64, max_stack_depth: u32) -> [u8; super::HEADER_LEN] {
    let mut header = header_with_prefix(SAMPLE_MAGIC, super::COMPRESSION_NONE);
    header[8..16].copy_from_slice(&entry_count.to_le_bytes());
    header[16..20].copy_from_slice(&max_stack_depth.to_le_bytes());
    header[24..32].copy_from_slice(&now_unix().to_le_bytes());
    header
}

/// Writes every interned stack and its count to `path`.
pub fn write_samples(
    path: &Path,
    map: &InternMap<CallStack>,
    max_stack_depth: u32,
    compress: bool,
) -> Result<(), CodecError> {
    let mut entries: Vec<(CallStack, u64)> = Vec::with_capacity(map.size());
    map.for_each(|stack, count| entries.push((stack.clone(), count)));

    // 16-byte entry header plus the used frames.
    let mut payload = Vec::with_capacity(entries.len() * 32);
    for (stack, count) in &entries {
        payload.extend_from_slice(&(stack.depth() as u32).to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&count.to_le_bytes());
        for addr in stack.frames() {
            payload.extend_from_slice(&addr.to_le_bytes());
        }
    }

    let header = sample_header(entries.len() as u64, max_stack_depth);
    write_file(path, header, &payload, compress)
}

/// Reads only the fixed header of a sample trace.
pub fn read_sample_header(path: &Path) -> Result<SampleFileInfo, CodecError> {
    let (header, _) = open_file(path, SAMPLE_MAGIC)?;
    Ok(info_from_header(&header))
}

fn info_from_header(header: &[u8; super::HEADER_LEN]) -> SampleFileInfo {
    SampleFileInfo {
        entry_count: get_u64(header, 8),
        max_stack_depth: get_u32(header, 16),
        timestamp: get_u64(header, 24),
        entries_read: 0,
        truncated: false,
    }
}

/// Decodes a sample trace into `map`, aggregating counts by stack identity.
///
/// The destination keeps anything it already held; decoded counts are added
/// on top. Fails with [`CodecError::OutOfCapacity`] when a decoded stack
/// would not fit.
pub fn read_samples_into(
    path: &Path,
    map: &InternMap<CallStack>,
) -> Result<SampleFileInfo, CodecError> {
    let (header, mut payload) = open_file(path, SAMPLE_MAGIC)?;
    let mut info = info_from_header(&header);

    if info.max_stack_depth as usize > MAX_STACK_DEPTH {
        return Err(CodecError::integrity(format!(
            "max_stack_depth {} exceeds supported {MAX_STACK_DEPTH}",
            info.max_stack_depth
        )));
    }

    let mut entry = [0u8; 16];
    let mut frame = [0u8; 8];
    for _ in 0..info.entry_count {
        if !read_exact_or_eof(&mut payload, &mut entry)? {
            info.truncated = true;
            break;
        }
        let depth = get_u32(&entry, 0);
        let count = get_u64(&entry, 8);
        if depth > info.max_stack_depth {
            return Err(CodecError::integrity(format!(
                "entry depth {depth} exceeds header max {}",
                info.max_stack_depth
            )));
        }

        let mut stack = CallStack::new();
        let mut complete = true;
        for _ in 0..depth {
            if !read_exact_or_eof(&mut payload, &mut frame)? {
                complete = false;
                break;
            }
            stack.push(u64::from_le_bytes(frame));
        }
        if !complete {
            info.truncated = true;
            break;
        }

        if !map.increment(&stack, count) {
            return Err(CodecError::OutOfCapacity);
        }
        info.entries_read += 1;
    }

    Ok(info)
}

/// Human-readable dump of a sample map; informational only.
pub fn write_samples_text(path: &Path, map: &InternMap<CallStack>) -> Result<(), CodecError> {
    let file = File::create(path).map_err(CodecError::FileOpen)?;
    let mut out = BufWriter::new(file);

    let write = |out: &mut BufWriter<File>, text: String| {
        out.write_all(text.as_bytes()).map_err(CodecError::FileWrite)
    };

    write(
        &mut out,
        format!(
            "# sample data (text format)\n# generated: {}\n# entries: {}\n\n",
            now_unix(),
            map.size()
        ),
    )?;

    let mut result = Ok(());
    map.for_each(|stack, count| {
        if result.is_err() {
            return;
        }
        let mut block = format!("[{count}] call stack (depth {})\n", stack.depth());
        for addr in stack.frames() {
            block.push_str(&format!("  {addr:#018x}\n"));
        }
        block.push('\n');
        result = write(&mut out, block);
    });
    result?;
    out.flush().map_err(CodecError::FileWrite)
}
