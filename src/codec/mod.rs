//! Self-describing binary codecs for sample traces, library maps and
//! performance trees.
//!
//! All three file kinds share a 64-byte fixed header: magic (4), version
//! (2), compression (1), reserved (1), then kind-specific fields padded to
//! 64 bytes. Integers are little-endian regardless of host. When the
//! compression byte is [`COMPRESSION_GZIP`], everything after the fixed
//! header is one gzip stream.
//!
//! Readers tolerate a truncated trailing entry: a file that is still being
//! written decodes to its complete prefix with the `truncated` flag set.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::CodecError;

mod libmap;
mod sample;
mod tree;

pub use libmap::{read_libmap, write_libmap, LibmapFileInfo};
pub use sample::{
    read_sample_header, read_samples_into, write_samples, write_samples_text, SampleFileInfo,
};
pub use tree::{read_tree, write_tree, write_tree_text};

/// `PFLW`
pub const SAMPLE_MAGIC: u32 = 0x5046_4C57;
/// `PFLM`
pub const LIBMAP_MAGIC: u32 = 0x5046_4C4D;
/// `PTRE`
pub const TREE_MAGIC: u32 = 0x5054_5245;

pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 64;

pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_GZIP: u8 = 1;

/// Longest region name accepted when decoding a library map.
pub const MAX_REGION_NAME_LEN: u32 = 4096;

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Starts a 64-byte header with the shared prefix.
pub(crate) fn header_with_prefix(magic: u32, compression: u8) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&magic.to_le_bytes());
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[6] = compression;
    header
}

/// Validates the shared prefix and returns the compression byte.
pub(crate) fn check_prefix(header: &[u8; HEADER_LEN], magic: u32) -> Result<u8, CodecError> {
    let found = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if found != magic {
        return Err(CodecError::InvalidFormat(found));
    }
    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if version > FORMAT_VERSION {
        return Err(CodecError::VersionMismatch(version));
    }
    let compression = header[6];
    if compression > COMPRESSION_GZIP {
        return Err(CodecError::CompressionUnsupported(compression));
    }
    Ok(compression)
}

/// Writes header and payload to `path`, compressing the payload if asked.
pub(crate) fn write_file(
    path: &Path,
    mut header: [u8; HEADER_LEN],
    payload: &[u8],
    compress: bool,
) -> Result<(), CodecError> {
    if compress {
        header[6] = COMPRESSION_GZIP;
    }
    let file = File::create(path).map_err(CodecError::FileOpen)?;
    let mut out = BufWriter::new(file);
    out.write_all(&header).map_err(CodecError::FileWrite)?;
    if compress {
        let mut enc = GzEncoder::new(&mut out, Compression::default());
        enc.write_all(payload).map_err(CodecError::FileWrite)?;
        enc.finish().map_err(CodecError::FileWrite)?;
    } else {
        out.write_all(payload).map_err(CodecError::FileWrite)?;
    }
    out.flush().map_err(CodecError::FileWrite)
}

/// Opens `path`, validates the prefix against `magic`, and returns the
/// header plus a reader positioned at the (possibly compressed) payload.
pub(crate) fn open_file(
    path: &Path,
    magic: u32,
) -> Result<([u8; HEADER_LEN], Box<dyn Read>), CodecError> {
    let file = File::open(path).map_err(CodecError::FileOpen)?;
    let mut reader = BufReader::new(file);
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(CodecError::FileRead)?;
    let compression = check_prefix(&header, magic)?;
    let payload: Box<dyn Read> = if compression == COMPRESSION_GZIP {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok((header, payload))
}

/// Fills `buf` completely, or reports a clean/truncated end of stream as
/// `Ok(false)`. Only genuine I/O failures become errors.
pub(crate) fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool, CodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(CodecError::FileRead(e)),
        }
    }
    Ok(true)
}

pub(crate) fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}
