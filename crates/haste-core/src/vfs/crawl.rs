use super::VfsError;
use haste_util::fs::{collect_files, normalize};
use rayon::prelude::*;
use regex_lite::Regex;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Path predicate shared by the crawler and the change processor.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Regex>,
    /// Matched against the path relative to the first of its roots that
    /// contains it.
    scoped: Vec<(Regex, Vec<PathBuf>)>,
}

impl IgnoreRules {
    /// Compile blacklist patterns (regular expressions over `/`-separated paths).
    ///
    /// # Errors
    /// Returns the offending pattern and the parser's message.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, (String, String)> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()).map_err(|e| (p.as_ref().to_string(), e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            scoped: Vec::new(),
        })
    }

    /// Add a pattern matched relative to `roots` (or against the full path
    /// when no root contains it).
    #[must_use]
    pub fn with_scoped_regex(mut self, regex: Regex, roots: Vec<PathBuf>) -> Self {
        self.scoped.push((regex, roots));
        self
    }

    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.patterns.is_empty() && self.scoped.is_empty() {
            return false;
        }
        let s = path.to_string_lossy().replace('\\', "/");
        if self.patterns.iter().any(|re| re.is_match(&s)) {
            return true;
        }
        self.scoped.iter().any(|(re, roots)| {
            let rel = roots
                .iter()
                .find_map(|root| path.strip_prefix(root).ok())
                .unwrap_or(path);
            re.is_match(&rel.to_string_lossy().replace('\\', "/"))
        })
    }
}

/// Crawl every root in parallel for files with one of `extensions`.
///
/// Overlapping roots yield each file once. The result is sorted.
///
/// # Errors
/// Returns `RootMissing` if a root cannot be read.
pub fn crawl(
    roots: &[PathBuf],
    extensions: &[String],
    ignore: &IgnoreRules,
) -> Result<Vec<PathBuf>, VfsError> {
    let start = Instant::now();

    let per_root: Vec<Vec<PathBuf>> = roots
        .par_iter()
        .map(|root| {
            let root = normalize(root);
            collect_files(
                &root,
                |p| ignore.is_ignored(p),
                |p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| extensions.iter().any(|x| x == e))
                },
            )
            .map_err(|_| VfsError::RootMissing(root.clone()))
        })
        .collect::<Result<_, _>>()?;

    let mut seen = FxHashSet::default();
    let mut files = Vec::new();
    for file in per_root.into_iter().flatten() {
        let file = normalize(&file);
        if seen.insert(file.clone()) {
            files.push(file);
        } else {
            debug!(path = %file.display(), "Skipping file reached through overlapping roots");
        }
    }
    files.sort();

    info!(
        roots = roots.len(),
        files = files.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Crawled project roots"
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_crawl_filters_and_dedups() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib/vendor")).unwrap();
        fs::write(dir.path().join("a.js"), "").unwrap();
        fs::write(dir.path().join("readme.md"), "").unwrap();
        fs::write(dir.path().join("lib/b.json"), "{}").unwrap();
        fs::write(dir.path().join("lib/vendor/c.js"), "").unwrap();

        let ignore = IgnoreRules::from_patterns(&["/vendor(/|$)"]).unwrap();
        let roots = vec![dir.path().to_path_buf(), dir.path().join("lib")];
        let files = crawl(&roots, &["js".into(), "json".into()], &ignore).unwrap();

        assert_eq!(
            files,
            vec![dir.path().join("a.js"), dir.path().join("lib/b.json")]
        );
    }

    #[test]
    fn test_scoped_pattern_is_relative_to_its_roots() {
        let ignore = IgnoreRules::default().with_scoped_regex(
            Regex::new("^build/").unwrap(),
            vec![PathBuf::from("/proj")],
        );
        assert!(ignore.is_ignored(Path::new("/proj/build/out.js")));
        assert!(!ignore.is_ignored(Path::new("/proj/src/build/out.js")));
        assert!(!ignore.is_ignored(Path::new("/other/build/out.js")));
    }

    #[test]
    fn test_crawl_missing_root() {
        let dir = tempdir().unwrap();
        let err = crawl(
            &[dir.path().join("missing")],
            &["js".into()],
            &IgnoreRules::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VfsError::RootMissing(_)));
    }

    #[test]
    fn test_bad_pattern_reports_source() {
        let (pattern, _) = IgnoreRules::from_patterns(&["(unclosed"]).unwrap_err();
        assert_eq!(pattern, "(unclosed");
    }
}
