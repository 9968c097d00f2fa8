//! Polling directory watcher feeding the online analyzer.
//!
//! The watcher only `stat`s files; it never opens, renames or deletes them.
//! A file is reported once on first sighting and again on every
//! `(mtime, size)` change, which is how a rank appending to its trace file
//! gets re-ingested.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use log::debug;

/// Classification of files the analyzer cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    SampleData,
    LibraryMap,
    PerformanceTree,
    Text,
    Unknown,
}

/// Classifies a path by extension; `.gz` wrappers are looked through.
pub fn file_type_of(path: &Path) -> FileType {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let name = name.strip_suffix(".gz").unwrap_or(name);
    if name.ends_with(".pflw") {
        FileType::SampleData
    } else if name.ends_with(".libmap") {
        FileType::LibraryMap
    } else if name.ends_with(".ptree") {
        FileType::PerformanceTree
    } else if name.ends_with(".txt") {
        FileType::Text
    } else {
        FileType::Unknown
    }
}

/// Recovers the rank from a `<stem>_rank_<N>.<suffix>` file name: the
/// decimal digits following the `rank_` marker.
pub fn rank_from_path(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let at = name.find("rank_")? + "rank_".len();
    let digits: String = name[at..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

type Callback = dyn Fn(&Path, FileType, bool) + Send + Sync;

struct Seen {
    mtime: SystemTime,
    size: u64,
}

/// Watches a directory tree by polling.
pub struct DirectoryWatcher {
    directory: PathBuf,
    interval: Duration,
    callback: Arc<Callback>,
    seen: Arc<Mutex<HashMap<PathBuf, Seen>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    pub fn new(
        directory: impl Into<PathBuf>,
        interval: Duration,
        callback: impl Fn(&Path, FileType, bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            directory: directory.into(),
            interval,
            callback: Arc::new(callback),
            seen: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Starts the poll thread. Returns `false` when already running.
    pub fn start(&mut self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let directory = self.directory.clone();
        let interval = self.interval;
        let callback = Arc::clone(&self.callback);
        let seen = Arc::clone(&self.seen);
        let running = Arc::clone(&self.running);
        self.thread = Some(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                scan(&directory, &seen, &callback);
                std::thread::sleep(interval);
            }
        }));
        true
    }

    /// Stops polling and joins the poll thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// One synchronous scan; useful without the poll thread.
    pub fn scan_once(&self) {
        scan(&self.directory, &self.seen, &self.callback);
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan(directory: &Path, seen: &Mutex<HashMap<PathBuf, Seen>>, callback: &Arc<Callback>) {
    let mut pending = vec![directory.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            let file_type = file_type_of(&path);
            if file_type == FileType::Unknown {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let size = meta.len();

            let is_new;
            let changed;
            {
                let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
                match seen.get_mut(&path) {
                    None => {
                        seen.insert(path.clone(), Seen { mtime, size });
                        is_new = true;
                        changed = true;
                    }
                    Some(prev) => {
                        is_new = false;
                        changed = prev.mtime != mtime || prev.size != size;
                        if changed {
                            prev.mtime = mtime;
                            prev.size = size;
                        }
                    }
                }
            }
            if changed {
                debug!(
                    "watcher: {} {:?} ({})",
                    path.display(),
                    file_type,
                    if is_new { "new" } else { "updated" }
                );
                callback(&path, file_type, is_new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn file_types_by_extension() {
        assert_eq!(file_type_of(Path::new("a_rank_0.pflw")), FileType::SampleData);
        assert_eq!(
            file_type_of(Path::new("a_rank_0.pflw.gz")),
            FileType::SampleData
        );
        assert_eq!(file_type_of(Path::new("a_rank_0.libmap")), FileType::LibraryMap);
        assert_eq!(file_type_of(Path::new("t.ptree")), FileType::PerformanceTree);
        assert_eq!(file_type_of(Path::new("t.ptree.txt")), FileType::Text);
        assert_eq!(file_type_of(Path::new("t.bin")), FileType::Unknown);
    }

    #[test]
    fn rank_parsing() {
        assert_eq!(rank_from_path(Path::new("/x/app_rank_0.pflw")), Some(0));
        assert_eq!(rank_from_path(Path::new("app_rank_127.libmap")), Some(127));
        assert_eq!(rank_from_path(Path::new("app_rank_12x7.pflw")), Some(12));
        assert_eq!(rank_from_path(Path::new("app.pflw")), None);
        assert_eq!(rank_from_path(Path::new("app_rank_.pflw")), None);
    }

    #[test]
    fn scan_reports_new_then_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let watcher = DirectoryWatcher::new(
            dir.path(),
            Duration::from_millis(10),
            move |path, file_type, is_new| {
                tx.lock()
                    .unwrap()
                    .send((path.to_path_buf(), file_type, is_new))
                    .unwrap();
            },
        );

        let path = dir.path().join("app_rank_0.pflw");
        std::fs::write(&path, b"one").unwrap();
        watcher.scan_once();
        let (seen_path, seen_type, is_new) = rx.try_recv().unwrap();
        assert_eq!(seen_path, path);
        assert_eq!(seen_type, FileType::SampleData);
        assert!(is_new);

        // Unchanged file: no report.
        watcher.scan_once();
        assert!(rx.try_recv().is_err());

        // Size change: reported again, not new.
        std::fs::write(&path, b"one more").unwrap();
        watcher.scan_once();
        let (_, _, is_new) = rx.try_recv().unwrap();
        assert!(!is_new);
    }

    #[test]
    fn irrelevant_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_millis(10), move |p, t, n| {
            tx.lock().unwrap().send((p.to_path_buf(), t, n)).unwrap();
        });
        std::fs::write(dir.path().join("notes.md"), b"x").unwrap();
        watcher.scan_once();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn start_and_stop_join_the_thread() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher =
            DirectoryWatcher::new(dir.path(), Duration::from_millis(5), |_, _, _| {});
        assert!(watcher.start());
        assert!(!watcher.start());
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }
}
