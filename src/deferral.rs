//! Archives waiting for a named dependency to become active.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

#[derive(Default)]
struct Waiting {
    by_dependency: BTreeMap<String, BTreeSet<PathBuf>>,
    by_archive: HashMap<PathBuf, String>,
}

/// Tracks which archives wait on which dependency name.
///
/// An archive waits under at most one dependency. Cycles are not detected:
/// archives that wait on each other stay deferred until one of the names
/// becomes active some other way.
#[derive(Default)]
pub struct DeferralTable {
    waiting: Mutex<Waiting>,
}

impl DeferralTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `archive` waits for `dependency`.
    ///
    /// Returns false if it was already waiting for that name. An archive
    /// waiting under a different name is moved.
    pub fn defer(&self, dependency: &str, archive: &Path) -> bool {
        let mut waiting = self.waiting.lock();

        if let Some(previous) = waiting.by_archive.get(archive).cloned() {
            if previous == dependency {
                return false;
            }
            if let Some(set) = waiting.by_dependency.get_mut(&previous) {
                set.remove(archive);
                if set.is_empty() {
                    waiting.by_dependency.remove(&previous);
                }
            }
        }

        waiting
            .by_archive
            .insert(archive.to_path_buf(), dependency.to_string());
        waiting
            .by_dependency
            .entry(dependency.to_string())
            .or_default()
            .insert(archive.to_path_buf())
    }

    /// Remove and return every archive waiting for `dependency`.
    pub fn resolve(&self, dependency: &str) -> Vec<PathBuf> {
        let mut waiting = self.waiting.lock();
        let Some(archives) = waiting.by_dependency.remove(dependency) else {
            return Vec::new();
        };
        for archive in &archives {
            waiting.by_archive.remove(archive);
        }
        archives.into_iter().collect()
    }

    /// Forget a waiting archive. Returns the name it was waiting for.
    pub fn cancel(&self, archive: &Path) -> Option<String> {
        let mut waiting = self.waiting.lock();
        let dependency = waiting.by_archive.remove(archive)?;
        if let Some(set) = waiting.by_dependency.get_mut(&dependency) {
            set.remove(archive);
            if set.is_empty() {
                waiting.by_dependency.remove(&dependency);
            }
        }
        Some(dependency)
    }

    /// The dependency `archive` waits for, if any.
    pub fn waiting_for(&self, archive: &Path) -> Option<String> {
        self.waiting.lock().by_archive.get(archive).cloned()
    }

    /// Archives waiting for `dependency`, without removing them.
    pub fn waiting_on(&self, dependency: &str) -> Vec<PathBuf> {
        self.waiting
            .lock()
            .by_dependency
            .get(dependency)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every pending entry.
    pub fn pending(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.waiting
            .lock()
            .by_dependency
            .iter()
            .map(|(dep, set)| (dep.clone(), set.iter().cloned().collect()))
            .collect()
    }

    /// Number of waiting archives.
    pub fn len(&self) -> usize {
        self.waiting.lock().by_archive.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DeferralTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferralTable")
            .field("waiting", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_defer_is_idempotent() {
        let table = DeferralTable::new();
        assert!(table.defer("Core", Path::new("b.pkg")));
        assert!(!table.defer("Core", Path::new("b.pkg")));

        assert_eq!(table.waiting_on("Core"), vec![PathBuf::from("b.pkg")]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_drains_once() {
        let table = DeferralTable::new();
        table.defer("Core", Path::new("b.pkg"));
        table.defer("Core", Path::new("c.pkg"));
        table.defer("Other", Path::new("d.pkg"));

        let drained = table.resolve("Core");
        assert_eq!(
            drained,
            vec![PathBuf::from("b.pkg"), PathBuf::from("c.pkg")]
        );
        assert!(table.resolve("Core").is_empty());
        assert_eq!(table.waiting_for(Path::new("d.pkg")).as_deref(), Some("Other"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_archive_waits_under_one_name() {
        let table = DeferralTable::new();
        table.defer("Core", Path::new("b.pkg"));
        table.defer("Base", Path::new("b.pkg"));

        assert!(table.waiting_on("Core").is_empty());
        assert_eq!(table.waiting_for(Path::new("b.pkg")).as_deref(), Some("Base"));
        assert_eq!(table.pending().len(), 1);
    }

    #[test]
    fn test_cancel() {
        let table = DeferralTable::new();
        table.defer("Core", Path::new("b.pkg"));

        assert_eq!(table.cancel(Path::new("b.pkg")).as_deref(), Some("Core"));
        assert!(table.is_empty());
        assert!(table.pending().is_empty());
        assert!(table.cancel(Path::new("b.pkg")).is_none());
    }

    #[test]
    fn test_mutual_waits_stay_pending() {
        let table = DeferralTable::new();
        table.defer("B", Path::new("a.pkg"));
        table.defer("A", Path::new("b.pkg"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.pending().len(), 2);
    }

    #[test]
    fn test_concurrent_defer_and_resolve() {
        let table = Arc::new(DeferralTable::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let path = PathBuf::from(format!("t{}-{}.pkg", i, j));
                        table.defer("Core", &path);
                    }
                })
            })
            .collect();

        let mut drained = 0;
        for t in threads {
            t.join().unwrap();
            drained += table.resolve("Core").len();
        }
        drained += table.resolve("Core").len();

        assert_eq!(drained, 400);
        assert!(table.is_empty());
    }
}
