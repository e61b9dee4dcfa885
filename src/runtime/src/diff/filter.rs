//! Include/exclude filtering for the change-set traversal.
//!
//! Entries are plain absolute paths (prefix semantics) or globs; a value
//! containing glob metacharacters is compiled into a glob set, anything
//! else filters by path prefix.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use nydus_commit_core::error::{CommitError, Result};

#[derive(Debug)]
pub struct PathFilter {
    include_prefixes: Vec<PathBuf>,
    include_globs: GlobSet,
    has_include_globs: bool,
    exclude_prefixes: Vec<PathBuf>,
    exclude_globs: GlobSet,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn build_globs(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| CommitError::Extraction(format!("glob '{}': {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| CommitError::Extraction(format!("build glob set: {}", e)))
}

impl PathFilter {
    pub fn new(with_paths: &[String], without_paths: &[String]) -> Result<Self> {
        let mut include_prefixes = Vec::new();
        let mut include_patterns = Vec::new();
        for path in with_paths {
            if is_glob(path) {
                include_patterns.push(path.as_str());
            } else {
                include_prefixes.push(PathBuf::from(path.trim_end_matches('/')));
            }
        }

        let mut exclude_prefixes = Vec::new();
        let mut exclude_patterns = Vec::new();
        for path in without_paths {
            if is_glob(path) {
                exclude_patterns.push(path.as_str());
            } else {
                exclude_prefixes.push(PathBuf::from(path.trim_end_matches('/')));
            }
        }

        Ok(Self {
            include_prefixes,
            include_globs: build_globs(&include_patterns)?,
            has_include_globs: !include_patterns.is_empty(),
            exclude_prefixes,
            exclude_globs: build_globs(&exclude_patterns)?,
        })
    }

    fn is_included(&self, path: &Path) -> bool {
        if self.include_prefixes.is_empty() && !self.has_include_globs {
            return true;
        }
        self.include_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
            || self.include_globs.is_match(path)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
            || self.exclude_globs.is_match(path)
    }

    /// Whether an entry at the container-absolute `path` belongs in the
    /// change set.
    pub fn should_emit(&self, path: &Path) -> bool {
        self.is_included(path) && !self.is_excluded(path)
    }

    /// Whether traversal should descend into the directory at `path`.
    ///
    /// Descends into ancestors of include prefixes so nested includes stay
    /// reachable; include globs disable pruning entirely.
    pub fn should_descend(&self, path: &Path) -> bool {
        if self.is_excluded(path) {
            return false;
        }
        if (self.include_prefixes.is_empty() && !self.has_include_globs)
            || self.has_include_globs
        {
            return true;
        }
        self.include_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix) || prefix.starts_with(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_emits_everything() {
        let filter = PathFilter::new(&[], &[]).unwrap();
        assert!(filter.should_emit(Path::new("/etc/passwd")));
        assert!(filter.should_descend(Path::new("/etc")));
    }

    #[test]
    fn test_include_prefix() {
        let filter = PathFilter::new(&["/guest/x".to_string()], &[]).unwrap();
        assert!(filter.should_emit(Path::new("/guest/x")));
        assert!(filter.should_emit(Path::new("/guest/x/a/b")));
        assert!(!filter.should_emit(Path::new("/guest/y")));
        // Prefix semantics are per path component
        assert!(!filter.should_emit(Path::new("/guest/xy")));
    }

    #[test]
    fn test_descend_into_include_ancestors() {
        let filter = PathFilter::new(&["/guest/x/deep".to_string()], &[]).unwrap();
        assert!(filter.should_descend(Path::new("/guest")));
        assert!(filter.should_descend(Path::new("/guest/x")));
        assert!(filter.should_descend(Path::new("/guest/x/deep/below")));
        assert!(!filter.should_descend(Path::new("/other")));
    }

    #[test]
    fn test_exclude_prefix_wins() {
        let filter = PathFilter::new(
            &["/data".to_string()],
            &["/data/cache".to_string()],
        )
        .unwrap();
        assert!(filter.should_emit(Path::new("/data/keep")));
        assert!(!filter.should_emit(Path::new("/data/cache")));
        assert!(!filter.should_emit(Path::new("/data/cache/x")));
        assert!(!filter.should_descend(Path::new("/data/cache")));
    }

    #[test]
    fn test_glob_include() {
        let filter = PathFilter::new(&["/logs/**/*.log".to_string()], &[]).unwrap();
        assert!(filter.should_emit(Path::new("/logs/app/today.log")));
        assert!(!filter.should_emit(Path::new("/logs/app/today.txt")));
        // Globs cannot prune traversal
        assert!(filter.should_descend(Path::new("/anything")));
    }

    #[test]
    fn test_glob_exclude() {
        let filter = PathFilter::new(&[], &["/**/*.tmp".to_string()]).unwrap();
        assert!(filter.should_emit(Path::new("/data/file")));
        assert!(!filter.should_emit(Path::new("/data/file.tmp")));
    }

    #[test]
    fn test_trailing_slash_normalized() {
        let filter = PathFilter::new(&["/guest/x/".to_string()], &[]).unwrap();
        assert!(filter.should_emit(Path::new("/guest/x/a")));
    }
}
