use std::path::Path;

use crate::error::CodecError;
use crate::sample::{LibraryMap, LibraryRegion};

use super::{
    get_u32, get_u64, header_with_prefix, now_unix, open_file, read_exact_or_eof, write_file,
    LIBMAP_MAGIC, MAX_REGION_NAME_LEN,
};

/// Header fields and decode outcome of a library-map file.
#[derive(Clone, Copy, Debug)]
pub struct LibmapFileInfo {
    pub process_id: u32,
    pub library_count: u32,
    pub timestamp: u64,
    pub regions_read: u32,
    pub truncated: bool,
}

// Header layout after the shared prefix:
//   8..12  process_id
//  12..16  library_count
//  16..24  timestamp
//  24..64  reserved
/// Persists a library-map snapshot tagged with the producing process.
pub fn write_libmap(
    path: &Path,
    map: &LibraryMap,
    process_id: u32,
) -> Result<(), CodecError> {
    let mut header = header_with_prefix(LIBMAP_MAGIC, super::COMPRESSION_NONE);
    header[8..12].copy_from_slice(&process_id.to_le_bytes());
    header[12..16].copy_from_slice(&(map.len() as u32).to_le_bytes());
    header[16..24].copy_from_slice(&now_unix().to_le_bytes());

    // 24-byte entry header plus the UTF-8 name.
    let mut payload = Vec::with_capacity(map.len() * 64);
    for region in map.regions() {
        payload.extend_from_slice(&region.base.to_le_bytes());
        payload.extend_from_slice(&region.end.to_le_bytes());
        payload.push(u8::from(region.executable));
        payload.extend_from_slice(&[0u8; 3]);
        payload.extend_from_slice(&(region.name.len() as u32).to_le_bytes());
        payload.extend_from_slice(region.name.as_bytes());
    }

    write_file(path, header, &payload, false)
}

/// Decodes a library-map snapshot and the process id it was taken from.
pub fn read_libmap(path: &Path) -> Result<(LibraryMap, LibmapFileInfo), CodecError> {
    let (header, mut payload) = open_file(path, LIBMAP_MAGIC)?;
    let mut info = LibmapFileInfo {
        process_id: get_u32(&header, 8),
        library_count: get_u32(&header, 12),
        timestamp: get_u64(&header, 16),
        regions_read: 0,
        truncated: false,
    };

    let mut map = LibraryMap::new();
    // 24-byte entry header: base, end, executable, padding, name length.
    let mut entry = [0u8; 24];
    for _ in 0..info.library_count {
        if !read_exact_or_eof(&mut payload, &mut entry)? {
            info.truncated = true;
            break;
        }
        let base = get_u64(&entry, 0);
        let end = get_u64(&entry, 8);
        let executable = entry[16] != 0;
        let name_len = get_u32(&entry, 20);
        if name_len > MAX_REGION_NAME_LEN {
            return Err(CodecError::integrity(format!(
                "region name length {name_len} exceeds {MAX_REGION_NAME_LEN}"
            )));
        }

        let mut name_buf = vec![0u8; name_len as usize];
        if !read_exact_or_eof(&mut payload, &mut name_buf)? {
            info.truncated = true;
            break;
        }
        let name = String::from_utf8(name_buf)
            .map_err(|_| CodecError::integrity("region name is not valid UTF-8"))?;

        map.push_region(LibraryRegion {
            name,
            base,
            end,
            executable,
        });
        info.regions_read += 1;
    }

    Ok((map, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn test_map() -> LibraryMap {
        let mut map = LibraryMap::new();
        assert!(map.parse_from(
            "7f8a4c000000-7f8a4c021000 r-xp 00000000 08:01 123 /lib/libc.so.6\n\
             5555c0000000-5555c0010000 r-xp 00000000 08:02 456 /usr/bin/app\n\
             7ffe12400000-7ffe12402000 r-xp 00000000 00:00 0 [vdso]\n"
        ));
        map
    }

    #[test]
    fn round_trip_with_process_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.libmap");
        let map = test_map();
        write_libmap(&path, &map, 7).unwrap();

        let (decoded, info) = read_libmap(&path).unwrap();
        assert_eq!(info.process_id, 7);
        assert_eq!(info.library_count, 3);
        assert_eq!(info.regions_read, 3);
        assert!(!info.truncated);
        assert_eq!(decoded.regions(), map.regions());
        assert_eq!(
            decoded.resolve(0x7f8a4c010000),
            Some(("/lib/libc.so.6", 0x10000))
        );
    }

    #[test]
    fn oversized_name_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.libmap");
        write_libmap(&path, &test_map(), 0).unwrap();

        // Patch the first entry's name length beyond the documented maximum;
        // the field sits at offset 20 of the 20-byte entry header.
        let name_len_at = super::super::HEADER_LEN as u64 + 20;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(name_len_at)).unwrap();
        file.write_all(&(MAX_REGION_NAME_LEN + 1).to_le_bytes())
            .unwrap();

        assert!(matches!(read_libmap(&path), Err(CodecError::Integrity(_))));
    }

    #[test]
    fn truncated_map_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.libmap");
        write_libmap(&path, &test_map(), 1).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..len as usize - 3]).unwrap();

        let (decoded, info) = read_libmap(&path).unwrap();
        assert!(info.truncated);
        assert_eq!(info.regions_read, 2);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pflw");
        // A sample file is not a library map.
        let map = crate::sample::InternMap::new(8);
        crate::codec::write_samples(&path, &map, 64, false).unwrap();
        assert!(matches!(
            read_libmap(&path),
            Err(CodecError::InvalidFormat(m)) if m == crate::codec::SAMPLE_MAGIC
        ));
    }
}
