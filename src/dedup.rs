use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Condvar, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::store::walk_files;

/// Process-wide map of safe identity to an already materialized PDF.
///
/// Entries are only ever added. The in-flight set makes the three-step
/// check-then-record atomic per identity: a second worker asking for an
/// identity that is being fetched blocks until the first one settles.
#[derive(Debug, Default)]
pub struct DedupIndex {
    state: Mutex<IndexState>,
    settled: Condvar,
}

#[derive(Debug, Default)]
struct IndexState {
    known: HashMap<String, Utf8PathBuf>,
    in_flight: HashSet<String>,
}

#[derive(Debug)]
pub enum Claim<'a> {
    ExistedGlobal(Utf8PathBuf),
    ExistedSubdir(Utf8PathBuf),
    Acquired(ClaimGuard<'a>),
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan_all(&self, root: &Utf8Path) -> usize {
        info!(root = %root, "scanning output tree for existing PDFs");
        let mut found = HashMap::new();
        if !root.as_std_path().is_dir() {
            warn!(root = %root, "scan root does not exist");
        } else {
            for path in walk_files(root.as_std_path()) {
                let is_pdf = path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("pdf"))
                    .unwrap_or(false);
                if !is_pdf {
                    continue;
                }
                let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                    warn!("skipping non-utf8 path during scan");
                    continue;
                };
                if let Some(stem) = path.file_stem() {
                    found.insert(stem.to_string(), path.clone());
                }
            }
        }
        let count = found.len();
        self.lock().known = found;
        info!(root = %root, count, "output tree scan complete");
        count
    }

    pub fn lookup(&self, safe_id: &str) -> Option<Utf8PathBuf> {
        self.lock().known.get(safe_id).cloned()
    }

    pub fn record(&self, safe_id: &str, path: &Utf8Path) {
        self.lock()
            .known
            .insert(safe_id.to_string(), path.to_path_buf());
    }

    /// Global hit elsewhere, global hit at `target`, then a direct non-empty
    /// file check at `target`; only a miss on all three hands out a guard.
    pub fn claim<'a>(&'a self, safe_id: &str, target: &Utf8Path) -> Claim<'a> {
        let mut state = self.lock();
        while state.in_flight.contains(safe_id) {
            state = match self.settled.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        if let Some(existing) = state.known.get(safe_id) {
            if same_path(existing, target) {
                return Claim::ExistedSubdir(target.to_path_buf());
            }
            return Claim::ExistedGlobal(existing.clone());
        }

        if has_content(target) {
            state
                .known
                .insert(safe_id.to_string(), target.to_path_buf());
            return Claim::ExistedSubdir(target.to_path_buf());
        }

        state.in_flight.insert(safe_id.to_string());
        Claim::Acquired(ClaimGuard {
            index: self,
            safe_id: safe_id.to_string(),
            released: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, safe_id: &str, path: Option<&Utf8Path>) {
        let mut state = self.lock();
        if let Some(path) = path {
            state
                .known
                .insert(safe_id.to_string(), path.to_path_buf());
        }
        state.in_flight.remove(safe_id);
        drop(state);
        self.settled.notify_all();
    }
}

#[derive(Debug)]
pub struct ClaimGuard<'a> {
    index: &'a DedupIndex,
    safe_id: String,
    released: bool,
}

impl ClaimGuard<'_> {
    pub fn complete(mut self, path: &Utf8Path) {
        self.index.release(&self.safe_id, Some(path));
        self.released = true;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.index.release(&self.safe_id, None);
        }
    }
}

fn has_content(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn same_path(left: &Utf8Path, right: &Utf8Path) -> bool {
    if left == right {
        return true;
    }
    match (
        fs::canonicalize(left.as_std_path()),
        fs::canonicalize(right.as_std_path()),
    ) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}
