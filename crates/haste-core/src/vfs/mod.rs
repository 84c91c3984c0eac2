//! In-memory mirror of the watched directory trees.
//!
//! The tree is keyed by normalized absolute path. Directory nodes keep the
//! set of child basenames; file nodes memoize their content and stat on
//! first access. Attached roots are crawled up front and kept in sync by
//! [`Vfs::process_file_change`]; detached roots are read through to the
//! real filesystem on demand.

mod crawl;

pub use crawl::{crawl, IgnoreRules};

use crate::watch::ChangeType;
use haste_util::fs::{is_descendant, mtime_ms, normalize, read_to_string_lossy};
use regex_lite::Regex;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by virtual filesystem lookups.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("File {} not found in any of the roots", .0.display())]
    NotInRoots(PathBuf),

    #[error("Unable to find file with path: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Expected {} to be a file", .0.display())]
    NotAFile(PathBuf),

    #[error("Expected {} to be a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("Root {} does not exist", .0.display())]
    RootMissing(PathBuf),

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Cached stat for a file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: u64,
}

/// A normalized change re-emitted to downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeType,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
struct FileData {
    content: OnceLock<Arc<str>>,
    stat: OnceLock<FileStat>,
}

#[derive(Debug)]
enum Node {
    Dir(BTreeSet<String>),
    File(Arc<FileData>),
}

/// The virtual filesystem.
#[derive(Debug)]
pub struct Vfs {
    roots: Vec<PathBuf>,
    detached: RwLock<Vec<PathBuf>>,
    nodes: RwLock<FxHashMap<PathBuf, Node>>,
    ignore: IgnoreRules,
    extensions: Vec<String>,
}

impl Vfs {
    /// Build the tree from a finished crawl.
    ///
    /// Files outside every root are dropped.
    ///
    /// # Errors
    /// Returns `RootMissing` if a root directory does not exist.
    pub fn build(
        roots: &[PathBuf],
        files: Vec<PathBuf>,
        ignore: IgnoreRules,
        extensions: Vec<String>,
    ) -> Result<Self, VfsError> {
        let start = Instant::now();
        let roots: Vec<PathBuf> = roots.iter().map(|r| normalize(r)).collect();
        for root in &roots {
            if !root.is_dir() {
                return Err(VfsError::RootMissing(root.clone()));
            }
        }

        let vfs = Self {
            roots,
            detached: RwLock::new(Vec::new()),
            nodes: RwLock::new(FxHashMap::default()),
            ignore,
            extensions,
        };

        {
            let mut nodes = vfs.nodes.write().unwrap();
            for root in &vfs.roots {
                nodes
                    .entry(root.clone())
                    .or_insert_with(|| Node::Dir(BTreeSet::new()));
            }
            let mut count = 0usize;
            for file in files {
                let file = normalize(&file);
                if vfs.attached_root(&file).is_none() {
                    continue;
                }
                insert_file(&mut nodes, &file, &vfs.roots);
                count += 1;
            }
            info!(
                files = count,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Built in-memory filesystem"
            );
        }

        Ok(vfs)
    }

    /// Attached roots, in configuration order.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    #[must_use]
    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    /// Register a directory outside the attached roots whose files are
    /// read straight from disk.
    pub fn add_detached_root(&self, root: &Path) {
        let root = normalize(root);
        let mut detached = self.detached.write().unwrap();
        if !detached.contains(&root) {
            debug!(root = %root.display(), "Adding detached root");
            detached.push(root);
        }
    }

    fn attached_root(&self, path: &Path) -> Option<&PathBuf> {
        self.roots.iter().find(|root| is_descendant(root, path))
    }

    fn is_detached(&self, path: &Path) -> bool {
        self.detached
            .read()
            .unwrap()
            .iter()
            .any(|root| is_descendant(root, path))
    }

    /// Read a file's content, memoized per node.
    ///
    /// # Errors
    /// Fails if the path is outside every root, missing, a directory, or unreadable.
    pub fn read_file(&self, path: &Path) -> Result<Arc<str>, VfsError> {
        let path = normalize(path);
        if self.attached_root(&path).is_none() {
            return self.read_detached(&path);
        }

        let data = self.file_data(&path)?;
        if let Some(content) = data.content.get() {
            return Ok(content.clone());
        }
        let content: Arc<str> = read_to_string_lossy(&path)
            .map_err(|source| VfsError::Io {
                path: path.clone(),
                source,
            })?
            .into();
        Ok(data.content.get_or_init(|| content).clone())
    }

    fn read_detached(&self, path: &Path) -> Result<Arc<str>, VfsError> {
        if !self.is_detached(path) {
            return Err(VfsError::NotInRoots(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(VfsError::NotFound(path.to_path_buf()));
        }
        read_to_string_lossy(path)
            .map(Into::into)
            .map_err(|source| VfsError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Stat a file, memoized per node.
    ///
    /// # Errors
    /// Same failure modes as [`Vfs::read_file`].
    pub fn stat(&self, path: &Path) -> Result<FileStat, VfsError> {
        let path = normalize(path);
        if self.attached_root(&path).is_none() {
            if !self.is_detached(&path) {
                return Err(VfsError::NotInRoots(path));
            }
            return stat_from_disk(&path);
        }
        let data = self.file_data(&path)?;
        if let Some(stat) = data.stat.get() {
            return Ok(*stat);
        }
        let stat = stat_from_disk(&path)?;
        Ok(*data.stat.get_or_init(|| stat))
    }

    fn file_data(&self, path: &Path) -> Result<Arc<FileData>, VfsError> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir(_)) => Err(VfsError::NotAFile(path.to_path_buf())),
            None => Err(VfsError::NotFound(path.to_path_buf())),
        }
    }

    /// `false` for directories, missing files and paths outside every root.
    #[must_use]
    pub fn file_exists(&self, path: &Path) -> bool {
        let path = normalize(path);
        if self.attached_root(&path).is_some() {
            return matches!(self.nodes.read().unwrap().get(&path), Some(Node::File(_)));
        }
        self.is_detached(&path) && path.is_file()
    }

    #[must_use]
    pub fn dir_exists(&self, path: &Path) -> bool {
        let path = normalize(path);
        if self.attached_root(&path).is_some() {
            return matches!(self.nodes.read().unwrap().get(&path), Some(Node::Dir(_)));
        }
        self.is_detached(&path) && path.is_dir()
    }

    /// Nearest file named `name` in an ancestor directory of `path`.
    #[must_use]
    pub fn closest(&self, path: &Path, name: &str) -> Option<PathBuf> {
        let path = normalize(path);
        let mut dir = path.parent();
        while let Some(current) = dir {
            let candidate = current.join(name);
            if self.file_exists(&candidate) {
                return Some(candidate);
            }
            if self.attached_root(current).is_none() && !self.is_detached(current) {
                return None;
            }
            dir = current.parent();
        }
        None
    }

    /// Entries of `dir` whose full path matches `pattern`.
    ///
    /// # Errors
    /// Fails if `dir` is not a known directory.
    pub fn matches(&self, dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>, VfsError> {
        let dir = normalize(dir);
        let nodes = self.nodes.read().unwrap();
        match nodes.get(&dir) {
            Some(Node::Dir(children)) => Ok(children
                .iter()
                .map(|name| dir.join(name))
                .filter(|p| pattern.is_match(&slash(p)))
                .collect()),
            Some(Node::File(_)) => Err(VfsError::NotADirectory(dir)),
            None if self.attached_root(&dir).is_none() => Err(VfsError::NotInRoots(dir)),
            None => Err(VfsError::NotFound(dir)),
        }
    }

    /// Every known file whose path matches `pattern`, sorted.
    #[must_use]
    pub fn match_files_by_pattern(&self, pattern: &Regex) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .nodes
            .read()
            .unwrap()
            .iter()
            .filter(|(p, node)| matches!(node, Node::File(_)) && pattern.is_match(&slash(p)))
            .map(|(p, _)| p.clone())
            .collect();
        out.sort();
        out
    }

    /// Every known file, sorted.
    #[must_use]
    pub fn all_files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .nodes
            .read()
            .unwrap()
            .iter()
            .filter(|(_, node)| matches!(node, Node::File(_)))
            .map(|(p, _)| p.clone())
            .collect();
        out.sort();
        out
    }

    /// Every known file below the directory `dir`, sorted. Empty when `dir`
    /// is not a known directory.
    #[must_use]
    pub fn files_under(&self, dir: &Path) -> Vec<PathBuf> {
        let dir = normalize(dir);
        if !matches!(self.nodes.read().unwrap().get(&dir), Some(Node::Dir(_))) {
            return Vec::new();
        }
        self.all_files()
            .into_iter()
            .filter(|p| *p != dir && is_descendant(&dir, p))
            .collect()
    }

    /// Every known file with one of the given extensions, sorted.
    #[must_use]
    pub fn find_files_by_exts(&self, exts: &[&str]) -> Vec<PathBuf> {
        self.all_files()
            .into_iter()
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| exts.contains(&e))
            })
            .collect()
    }

    /// Apply a raw watcher event.
    ///
    /// Returns the normalized change for downstream consumers, or `None` if
    /// the event is ignored (directory, ignored path, outside every root,
    /// untracked extension).
    pub fn process_file_change(
        &self,
        kind: ChangeType,
        root: &Path,
        relative_path: &Path,
    ) -> Option<FileChange> {
        let path = normalize(&root.join(relative_path));
        if path.is_dir() {
            return None;
        }
        if self.ignore.is_ignored(&path) {
            return None;
        }
        self.attached_root(&path)?;
        let known_dir = matches!(self.nodes.read().unwrap().get(&path), Some(Node::Dir(_)));
        if !known_dir && !self.has_tracked_extension(&path) {
            return None;
        }

        let mut nodes = self.nodes.write().unwrap();
        if matches!(kind, ChangeType::Delete | ChangeType::Change) {
            remove_node(&mut nodes, &path);
        }
        if kind != ChangeType::Delete {
            if path.is_file() {
                insert_file(&mut nodes, &path, &self.roots);
            } else {
                debug!(path = %path.display(), "File vanished before it could be added");
            }
        }
        drop(nodes);

        debug!(path = %path.display(), ?kind, "Processed file change");
        Some(FileChange { kind, path })
    }

    fn has_tracked_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x == e))
    }
}

fn stat_from_disk(path: &Path) -> Result<FileStat, VfsError> {
    let meta = std::fs::metadata(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            VfsError::NotFound(path.to_path_buf())
        } else {
            VfsError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    if !meta.is_file() {
        return Err(VfsError::NotAFile(path.to_path_buf()));
    }
    Ok(FileStat {
        size: meta.len(),
        mtime_ms: mtime_ms(path).unwrap_or(0),
    })
}

fn slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn insert_file(nodes: &mut FxHashMap<PathBuf, Node>, file: &Path, roots: &[PathBuf]) {
    nodes.insert(file.to_path_buf(), Node::File(Arc::new(FileData::default())));

    let mut child = file;
    while let Some(parent) = child.parent() {
        let name = match child.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => break,
        };
        let is_new = !nodes.contains_key(parent);
        match nodes
            .entry(parent.to_path_buf())
            .or_insert_with(|| Node::Dir(BTreeSet::new()))
        {
            Node::Dir(children) => {
                children.insert(name);
            }
            Node::File(_) => break,
        }
        if !is_new || roots.iter().any(|r| r == parent) {
            break;
        }
        child = parent;
    }
}

fn remove_node(nodes: &mut FxHashMap<PathBuf, Node>, path: &Path) {
    if let Some(Node::Dir(children)) = nodes.remove(path) {
        for name in children {
            remove_node(nodes, &path.join(name));
        }
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Some(Node::Dir(children)) = nodes.get_mut(parent) {
            children.remove(name.to_string_lossy().as_ref());
        }
    }
}
