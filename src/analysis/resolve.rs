use std::collections::BTreeMap;

use serde::Serialize;

use crate::sample::{CallStack, LibraryMap, RawSample};

use super::symbols::SymbolResolver;

/// Name given to frames no library-map snapshot could place.
pub const UNRESOLVED_LIBRARY: &str = "[unresolved]";

/// One call-stack frame after address resolution.
///
/// Any suffix of the symbolic fields may be empty when unresolved, but
/// `function_name` is never empty: it falls back to the hex form of the
/// offset (or the raw address) so downstream consumers always have a label.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResolvedFrame {
    pub raw_address: u64,
    pub library_name: String,
    pub offset: u64,
    pub function_name: String,
    pub filename: String,
    pub line_number: u32,
}

impl ResolvedFrame {
    fn unresolved(addr: u64) -> Self {
        Self {
            raw_address: addr,
            library_name: UNRESOLVED_LIBRARY.to_string(),
            offset: addr,
            function_name: format!("{addr:#x}"),
            ..Self::default()
        }
    }

    /// `file:line` when known, empty otherwise.
    pub fn source_location(&self) -> String {
        if self.filename.is_empty() || self.line_number == 0 {
            String::new()
        } else {
            format!("{}:{}", self.filename, self.line_number)
        }
    }
}

/// Applies library-map snapshots and an optional symbol resolver to turn raw
/// call stacks into [`ResolvedFrame`] sequences.
///
/// Snapshots are keyed by map id; one resolver typically holds the snapshot
/// of every rank taking part in an analysis.
#[derive(Default)]
pub struct AddressResolver {
    snapshots: BTreeMap<u32, LibraryMap>,
    symbols: Option<SymbolResolver>,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, id: u32, map: LibraryMap) {
        self.snapshots.insert(id, map);
    }

    pub fn has_snapshot(&self, id: u32) -> bool {
        self.snapshots.contains_key(&id)
    }

    pub fn snapshot(&self, id: u32) -> Option<&LibraryMap> {
        self.snapshots.get(&id)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Binds the symbolization layer used when `resolve_symbols` is set.
    pub fn bind_symbols(&mut self, resolver: SymbolResolver) {
        self.symbols = Some(resolver);
    }

    pub fn symbols(&self) -> Option<&SymbolResolver> {
        self.symbols.as_ref()
    }

    /// Converts a raw stack, frame by frame in captured order.
    pub fn convert(
        &self,
        stack: &CallStack,
        map_id: u32,
        resolve_symbols: bool,
    ) -> Vec<ResolvedFrame> {
        let map = self.snapshots.get(&map_id);
        stack
            .frames()
            .iter()
            .map(|addr| self.convert_addr(*addr, map, resolve_symbols))
            .collect()
    }

    /// Converts a batch of raw samples, each against its own snapshot.
    pub fn convert_batch(
        &self,
        samples: &[RawSample],
        resolve_symbols: bool,
    ) -> Vec<Vec<ResolvedFrame>> {
        samples
            .iter()
            .map(|s| self.convert(&s.stack, s.map_id, resolve_symbols))
            .collect()
    }

    fn convert_addr(
        &self,
        addr: u64,
        map: Option<&LibraryMap>,
        resolve_symbols: bool,
    ) -> ResolvedFrame {
        let Some((library, offset)) = map.and_then(|m| m.resolve(addr)) else {
            return ResolvedFrame::unresolved(addr);
        };

        let mut frame = ResolvedFrame {
            raw_address: addr,
            library_name: library.to_string(),
            offset,
            ..ResolvedFrame::default()
        };

        if resolve_symbols {
            if let Some(symbols) = &self.symbols {
                let info = symbols.resolve(library, offset);
                frame.function_name = info.function_name;
                frame.filename = info.filename;
                frame.line_number = info.line_number;
            }
        }
        if frame.function_name.is_empty() {
            frame.function_name = format!("{offset:#x}");
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> LibraryMap {
        let mut map = LibraryMap::new();
        assert!(map.parse_from(
            "7f8a4c000000-7f8a4c021000 r-xp 00000000 08:01 123 /lib/libc.so.6\n\
             5555c0000000-5555c0010000 r-xp 00000000 08:02 456 /usr/bin/app\n"
        ));
        map
    }

    #[test]
    fn converts_against_the_right_snapshot() {
        let mut resolver = AddressResolver::new();
        resolver.add_snapshot(3, snapshot());
        assert!(resolver.has_snapshot(3));
        assert!(!resolver.has_snapshot(0));

        let stack = CallStack::from_frames(&[0x7f8a4c010000, 0x5555c0001234]);
        let frames = resolver.convert(&stack, 3, false);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].library_name, "/lib/libc.so.6");
        assert_eq!(frames[0].offset, 0x10000);
        assert_eq!(frames[0].raw_address, 0x7f8a4c010000);
        assert_eq!(frames[1].library_name, "/usr/bin/app");
        assert_eq!(frames[1].offset, 0x1234);
    }

    #[test]
    fn missing_snapshot_produces_unresolved_frames() {
        let resolver = AddressResolver::new();
        let stack = CallStack::from_frames(&[0x4000]);
        let frames = resolver.convert(&stack, 9, false);
        assert_eq!(frames[0].library_name, UNRESOLVED_LIBRARY);
        assert_eq!(frames[0].offset, 0x4000);
        assert_eq!(frames[0].function_name, "0x4000");
    }

    #[test]
    fn unmapped_address_produces_unresolved_frame() {
        let mut resolver = AddressResolver::new();
        resolver.add_snapshot(0, snapshot());
        let frames = resolver.convert(&CallStack::from_frames(&[0x1000]), 0, false);
        assert_eq!(frames[0].library_name, UNRESOLVED_LIBRARY);
    }

    #[test]
    fn function_name_defaults_to_hex_offset() {
        let mut resolver = AddressResolver::new();
        resolver.add_snapshot(0, snapshot());
        let frames = resolver.convert(&CallStack::from_frames(&[0x7f8a4c010000]), 0, false);
        assert_eq!(frames[0].function_name, "0x10000");
    }

    #[test]
    fn convert_batch_uses_each_samples_map_id() {
        let mut resolver = AddressResolver::new();
        resolver.add_snapshot(1, snapshot());
        let samples = vec![
            RawSample {
                stack: CallStack::from_frames(&[0x7f8a4c000010]),
                timestamp_ns: 0,
                map_id: 1,
            },
            RawSample {
                stack: CallStack::from_frames(&[0x7f8a4c000010]),
                timestamp_ns: 0,
                map_id: 2,
            },
        ];
        let converted = resolver.convert_batch(&samples, false);
        assert_eq!(converted[0][0].library_name, "/lib/libc.so.6");
        assert_eq!(converted[1][0].library_name, UNRESOLVED_LIBRARY);
    }

    #[test]
    fn source_location_formatting() {
        let mut frame = ResolvedFrame::unresolved(0x1);
        assert_eq!(frame.source_location(), "");
        frame.filename = "main.c".into();
        frame.line_number = 42;
        assert_eq!(frame.source_location(), "main.c:42");
    }
}
