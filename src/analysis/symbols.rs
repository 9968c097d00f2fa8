use std::collections::HashMap;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use libc::{c_char, c_int, c_void};
use log::debug;

/// Symbolic information recovered for one `(library, offset)` pair.
///
/// Resolution failures are values, not errors: an unresolved result simply
/// has an empty function name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolInfo {
    pub function_name: String,
    pub filename: String,
    pub line_number: u32,
}

impl SymbolInfo {
    pub fn is_resolved(&self) -> bool {
        !self.function_name.is_empty()
    }
}

/// How offsets are turned into symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolStrategy {
    /// Only the dynamic linker's export table (`dladdr`). Fast, no source
    /// locations, and limited to exported symbols of loaded libraries.
    FastExportOnly,
    /// Only an external `addr2line` invocation over debug info. Slow but
    /// yields `file:line`.
    DebugInfoOnly,
    /// Fast first; fall back to debug info when unresolved.
    AutoFallback,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Resolves `(library_path, offset)` to [`SymbolInfo`].
///
/// The cache is shared and safe under concurrent use; simultaneous misses
/// for the same key may both invoke the strategy, which is acceptable since
/// caching is only a performance hint. Unresolved results are cached too so
/// a missing symbol is only probed once.
pub struct SymbolResolver {
    strategy: SymbolStrategy,
    cache: Option<Mutex<HashMap<(String, u64), SymbolInfo>>>,
    stats: CacheStats,
}

impl SymbolResolver {
    pub fn new(strategy: SymbolStrategy, enable_cache: bool) -> Self {
        Self {
            strategy,
            cache: enable_cache.then(|| Mutex::new(HashMap::new())),
            stats: CacheStats::default(),
        }
    }

    pub fn strategy(&self) -> SymbolStrategy {
        self.strategy
    }

    /// Resolves an offset within a library. Never fails; unknown libraries
    /// and unreachable symbolizers produce an unresolved result.
    pub fn resolve(&self, library_path: &str, offset: u64) -> SymbolInfo {
        if let Some(cache) = &self.cache {
            let key = (library_path.to_string(), offset);
            if let Some(hit) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return hit.clone();
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }

        let info = self.resolve_uncached(library_path, offset);
        debug!(
            "symbol {library_path}+{offset:#x} -> {}",
            if info.is_resolved() {
                info.function_name.as_str()
            } else {
                "<unresolved>"
            }
        );

        if let Some(cache) = &self.cache {
            cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert((library_path.to_string(), offset), info.clone());
        }
        info
    }

    /// `(hits, misses, size)` of the cache; all zero when caching is off.
    pub fn cache_stats(&self) -> (u64, u64, usize) {
        let size = self
            .cache
            .as_ref()
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0);
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            size,
        )
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        self.stats.hits.store(0, Ordering::Relaxed);
        self.stats.misses.store(0, Ordering::Relaxed);
    }

    fn resolve_uncached(&self, library_path: &str, offset: u64) -> SymbolInfo {
        // Pseudo regions like [vdso] or [anon] have nothing to resolve
        // against.
        if library_path.is_empty() || library_path.starts_with('[') {
            return SymbolInfo::default();
        }
        match self.strategy {
            SymbolStrategy::FastExportOnly => resolve_with_dladdr(library_path, offset),
            SymbolStrategy::DebugInfoOnly => resolve_with_addr2line(library_path, offset),
            SymbolStrategy::AutoFallback => {
                let info = resolve_with_dladdr(library_path, offset);
                if info.is_resolved() {
                    info
                } else {
                    resolve_with_addr2line(library_path, offset)
                }
            }
        }
    }
}

// glibc's link_map; only the head fields are touched.
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *mut c_void,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

const RTLD_DI_LINKMAP: c_int = 2;

// dladdr wants a live runtime address, so the library is located (or
// loaded) through the dynamic linker and the offset rebased onto it.
fn resolve_with_dladdr(library_path: &str, offset: u64) -> SymbolInfo {
    let Ok(path) = CString::new(library_path) else {
        return SymbolInfo::default();
    };

    unsafe {
        let mut handle = libc::dlopen(path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
        let opened_here = handle.is_null();
        if opened_here {
            handle = libc::dlopen(path.as_ptr(), libc::RTLD_LAZY);
            if handle.is_null() {
                return SymbolInfo::default();
            }
        }

        let mut map: *mut LinkMap = std::ptr::null_mut();
        let mut info = SymbolInfo::default();
        if libc::dlinfo(handle, RTLD_DI_LINKMAP, &mut map as *mut _ as *mut c_void) == 0
            && !map.is_null()
        {
            let addr = (*map).l_addr.wrapping_add(offset as usize) as *const c_void;
            let mut dl_info = MaybeUninit::<libc::Dl_info>::zeroed();
            if libc::dladdr(addr, dl_info.as_mut_ptr()) != 0 {
                let dl_info = dl_info.assume_init();
                if !dl_info.dli_sname.is_null() {
                    info.function_name = std::ffi::CStr::from_ptr(dl_info.dli_sname)
                        .to_string_lossy()
                        .into_owned();
                }
            }
        }

        if opened_here {
            libc::dlclose(handle);
        }
        info
    }
}

// `addr2line -e <lib> -f -C <offset>` prints the function name on the first
// line and `file:line` on the second; `??` marks the unresolved cases.
fn resolve_with_addr2line(library_path: &str, offset: u64) -> SymbolInfo {
    let output = Command::new("addr2line")
        .arg("-e")
        .arg(library_path)
        .arg("-f")
        .arg("-C")
        .arg(format!("{offset:#x}"))
        .output();

    let output = match output {
        Ok(out) if out.status.success() => out,
        _ => return SymbolInfo::default(),
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let mut lines = text.lines();
    let function = lines.next().unwrap_or("").trim().to_string();
    let location = lines.next().unwrap_or("").trim().to_string();

    if function.is_empty() || function == "??" {
        return SymbolInfo::default();
    }

    let mut info = SymbolInfo {
        function_name: function,
        ..SymbolInfo::default()
    };
    if location != "??:0" && location != "??:?" {
        if let Some((file, line)) = location.rsplit_once(':') {
            info.filename = file.to_string();
            info.line_number = line.parse().unwrap_or(0);
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_library_is_unresolved_not_an_error() {
        let resolver = SymbolResolver::new(SymbolStrategy::FastExportOnly, false);
        let info = resolver.resolve("/nonexistent/lib.so", 0x1234);
        assert!(!info.is_resolved());
        assert_eq!(resolver.cache_stats(), (0, 0, 0));
    }

    #[test]
    fn pseudo_regions_are_never_probed() {
        let resolver = SymbolResolver::new(SymbolStrategy::AutoFallback, true);
        assert!(!resolver.resolve("[vdso]", 0x10).is_resolved());
        assert!(!resolver.resolve("", 0x10).is_resolved());
    }

    #[test]
    fn repeated_resolution_is_idempotent_and_cached() {
        let resolver = SymbolResolver::new(SymbolStrategy::FastExportOnly, true);
        let first = resolver.resolve("/nonexistent/lib.so", 0x40);
        let (hits, misses, size) = resolver.cache_stats();
        assert_eq!((hits, misses, size), (0, 1, 1));

        for _ in 0..3 {
            assert_eq!(resolver.resolve("/nonexistent/lib.so", 0x40), first);
        }
        let (hits, misses, size) = resolver.cache_stats();
        assert_eq!((hits, misses, size), (3, 1, 1));
    }

    #[test]
    fn distinct_offsets_are_distinct_cache_keys() {
        let resolver = SymbolResolver::new(SymbolStrategy::FastExportOnly, true);
        resolver.resolve("/nonexistent/lib.so", 0x1);
        resolver.resolve("/nonexistent/lib.so", 0x2);
        let (_, misses, size) = resolver.cache_stats();
        assert_eq!((misses, size), (2, 2));
    }

    #[test]
    fn clear_cache_resets_stats() {
        let resolver = SymbolResolver::new(SymbolStrategy::FastExportOnly, true);
        resolver.resolve("/nonexistent/lib.so", 0x1);
        resolver.clear_cache();
        assert_eq!(resolver.cache_stats(), (0, 0, 0));
    }

    #[test]
    fn disabled_cache_keeps_stats_at_zero() {
        let resolver = SymbolResolver::new(SymbolStrategy::FastExportOnly, false);
        resolver.resolve("/nonexistent/lib.so", 0x1);
        resolver.resolve("/nonexistent/lib.so", 0x1);
        assert_eq!(resolver.cache_stats(), (0, 0, 0));
    }
}
