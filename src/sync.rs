//! Incremental file synchronization into a container.
//!
//! The cache remembers the content last written for every project path in the
//! current instance. Syncing a bundle writes only what changed and deletes
//! only what disappeared, so reloading an unchanged project touches nothing.

use crate::bundle::FileBundle;
use crate::error::{PreviewError, Result};
use crate::runtime::Container;
use crate::tree::build_tree;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Last-applied `path → content` for one container instance.
#[derive(Debug, Clone, Default)]
pub struct FileCache {
    entries: HashMap<String, String>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.entries.insert(path.into(), content.into());
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every directory that must already exist because a cached file lives in it.
    fn known_dirs(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for path in self.entries.keys() {
            let mut current = path.as_str();
            while let Some((parent, _)) = current.rsplit_once('/') {
                if !dirs.insert(parent.to_string()) {
                    break;
                }
                current = parent;
            }
        }
        dirs
    }
}

/// Whether `path` lies inside the package manager's output directory.
pub fn is_protected(path: &str, dependency_dir: &str) -> bool {
    let dir = dependency_dir.trim_matches('/');
    !dir.is_empty()
        && (path == dir
            || path
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/')))
}

/// What a sync has to do to move the container from the cached state to a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub writes: BTreeMap<String, String>,
    pub deletes: Vec<String>,
}

impl SyncPlan {
    /// Diff `bundle` against `cache`. Paths under `dependency_dir` are never
    /// scheduled for deletion.
    pub fn compute(cache: &FileCache, bundle: &FileBundle, dependency_dir: &str) -> Self {
        let writes = bundle
            .iter()
            .filter(|(path, content)| cache.get(path) != Some(content.as_str()))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect();

        let mut deletes: Vec<String> = cache
            .paths()
            .filter(|path| !bundle.contains_key(*path) && !is_protected(path, dependency_dir))
            .map(str::to_string)
            .collect();
        deletes.sort();

        Self { writes, deletes }
    }

    /// Plan for an explicit write list: no diffing, no deletions.
    pub fn writes_only(files: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            writes: files.into_iter().collect(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Outcome of [`apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    /// Deletions that failed; logged and dropped from the cache regardless.
    pub failed_deletes: Vec<String>,
    /// Whether the writes went out as a single mount call.
    pub mounted: bool,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.deleted.is_empty() && self.failed_deletes.is_empty()
    }
}

/// Apply `plan` to `container` and bring `cache` in line with what actually
/// happened. Deletions run first, then writes in path order. An empty plan
/// makes no container calls.
pub async fn apply(
    container: &dyn Container,
    cache: &mut FileCache,
    plan: SyncPlan,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    if plan.is_empty() {
        return Ok(report);
    }

    for path in plan.deletes {
        match container.remove(&path, false).await {
            Ok(()) => report.deleted.push(path.clone()),
            Err(e) => {
                tracing::warn!("Failed to delete {path} from sandbox: {e}");
                report.failed_deletes.push(path.clone());
            }
        }
        // A stale file with no cache entry is harmless.
        cache.remove(&path);
    }

    if plan.writes.is_empty() {
        return Ok(report);
    }

    if cache.is_empty() {
        let tree = build_tree(&plan.writes);
        container
            .mount(&tree)
            .await
            .map_err(|e| PreviewError::Mount(PreviewError::describe(&e)))?;
        report.mounted = true;
        for (path, content) in plan.writes {
            report.written.push(path.clone());
            cache.insert(path, content);
        }
        return Ok(report);
    }

    let mut dirs = cache.known_dirs();
    for (path, content) in plan.writes {
        write_one(container, &mut dirs, &path, &content).await?;
        report.written.push(path.clone());
        cache.insert(path, content);
    }

    Ok(report)
}

/// Write one file, creating its parent directory unless already known.
pub(crate) async fn write_one(
    container: &dyn Container,
    known_dirs: &mut BTreeSet<String>,
    path: &str,
    content: &str,
) -> Result<()> {
    if let Some((parent, _)) = path.rsplit_once('/') {
        if !known_dirs.contains(parent) {
            container
                .mkdir(parent)
                .await
                .map_err(|e| PreviewError::Write {
                    path: path.to_string(),
                    detail: PreviewError::describe(&e),
                })?;
            let mut current = parent;
            loop {
                known_dirs.insert(current.to_string());
                match current.rsplit_once('/') {
                    Some((up, _)) => current = up,
                    None => break,
                }
            }
        }
    }

    container
        .write_file(path, content)
        .await
        .map_err(|e| PreviewError::Write {
            path: path.to_string(),
            detail: PreviewError::describe(&e),
        })
}

/// Seed directory knowledge for callers that write outside [`apply`].
pub(crate) fn known_dirs(cache: &FileCache) -> BTreeSet<String> {
    cache.known_dirs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_of(pairs: &[(&str, &str)]) -> FileCache {
        let mut cache = FileCache::new();
        for (p, c) in pairs {
            cache.insert(*p, *c);
        }
        cache
    }

    fn bundle_of(pairs: &[(&str, &str)]) -> FileBundle {
        pairs
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect()
    }

    #[test]
    fn diff_writes_changed_and_deletes_missing() {
        let cache = cache_of(&[("a", "1"), ("b", "2")]);
        let bundle = bundle_of(&[("a", "1"), ("c", "3")]);

        let plan = SyncPlan::compute(&cache, &bundle, "node_modules");

        assert_eq!(plan.writes, bundle_of(&[("c", "3")]));
        assert_eq!(plan.deletes, vec!["b".to_string()]);
    }

    #[test]
    fn changed_content_is_rewritten() {
        let cache = cache_of(&[("src/App.tsx", "old")]);
        let bundle = bundle_of(&[("src/App.tsx", "new")]);
        let plan = SyncPlan::compute(&cache, &bundle, "node_modules");
        assert_eq!(plan.writes.get("src/App.tsx").map(String::as_str), Some("new"));
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn identical_bundle_yields_empty_plan() {
        let cache = cache_of(&[("a", "1"), ("b", "2")]);
        let bundle = bundle_of(&[("a", "1"), ("b", "2")]);
        assert!(SyncPlan::compute(&cache, &bundle, "node_modules").is_empty());
    }

    #[test]
    fn dependency_dir_is_never_deleted() {
        let cache = cache_of(&[
            ("node_modules/react/index.js", "x"),
            ("node_modules", "weird"),
            ("node_modules_backup.txt", "y"),
        ]);
        let plan = SyncPlan::compute(&cache, &FileBundle::new(), "node_modules");
        assert_eq!(plan.deletes, vec!["node_modules_backup.txt".to_string()]);
    }

    #[test]
    fn protection_matches_whole_segments() {
        assert!(is_protected("node_modules/.bin/vite", "node_modules"));
        assert!(is_protected("node_modules", "/node_modules/"));
        assert!(!is_protected("src/node_modules.ts", "node_modules"));
        assert!(!is_protected("anything", ""));
    }

    #[test]
    fn known_dirs_include_every_ancestor() {
        let cache = cache_of(&[("src/components/ui/Button.tsx", ""), ("index.html", "")]);
        let dirs: Vec<String> = cache.known_dirs().into_iter().collect();
        assert_eq!(dirs, vec!["src", "src/components", "src/components/ui"]);
    }

    #[test]
    fn writes_only_never_deletes() {
        let plan = SyncPlan::writes_only(vec![("b".to_string(), "2".to_string())]);
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.writes.len(), 1);
    }
}
