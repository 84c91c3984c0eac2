use super::{platform_extension, ModuleCache};
use crate::error::{Error, Result};
use crate::vfs::FileChange;
use crate::watch::ChangeType;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// What a haste name points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HasteEntry {
    Module(PathBuf),
    Package(PathBuf),
}

impl HasteEntry {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Module(p) | Self::Package(p) => p,
        }
    }
}

/// Global name index: name -> platform (`None` = generic) -> entry.
#[derive(Debug, Default)]
pub struct HasteMap {
    map: FxHashMap<String, FxHashMap<Option<String>, HasteEntry>>,
}

impl HasteMap {
    /// Scan every `.js` file and watch-root `package.json` for haste names.
    ///
    /// Detection runs in parallel; registration is sequential in path order
    /// so collisions are reported deterministically.
    ///
    /// # Errors
    /// Returns `NamingCollision` when two files claim the same slot, or an
    /// IO error if a file cannot be read.
    pub fn build(registry: &ModuleCache) -> Result<Self> {
        let start = Instant::now();
        let files = registry.vfs().find_files_by_exts(&["js", "json"]);

        let detected: Vec<Option<(String, HasteEntry)>> = files
            .par_iter()
            .map(|file| detect(registry, file))
            .collect::<Result<_>>()?;

        let mut map = Self::default();
        for (name, entry) in detected.into_iter().flatten() {
            map.register(registry, name, entry)?;
        }

        info!(
            names = map.map.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Built haste map"
        );
        Ok(map)
    }

    /// Entry for `name` on `platform`, falling back to the generic slot.
    #[must_use]
    pub fn get(&self, name: &str, platform: Option<&str>) -> Option<&HasteEntry> {
        let variants = self.map.get(name)?;
        platform
            .and_then(|p| variants.get(&Some(p.to_string())))
            .or_else(|| variants.get(&None))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Re-run detection for one file.
    ///
    /// Returns whether the names registered for the file changed.
    ///
    /// # Errors
    /// Returns `NamingCollision` if the file now collides with another.
    pub fn process_file_change(&mut self, registry: &ModuleCache, change: &FileChange) -> Result<bool> {
        let before = self.slots_for(&change.path);
        if matches!(change.kind, ChangeType::Delete | ChangeType::Change) {
            self.remove_path(&change.path);
        }

        let is_candidate = change
            .path
            .extension()
            .is_some_and(|e| e == "js" || e == "json");
        if change.kind != ChangeType::Delete && is_candidate {
            if let Some((name, entry)) = detect(registry, &change.path)? {
                self.register(registry, name, entry)?;
            }
        }
        Ok(self.slots_for(&change.path) != before)
    }

    /// Every (name, platform) slot held by `path`, sorted.
    fn slots_for(&self, path: &Path) -> Vec<(String, Option<String>)> {
        let mut slots: Vec<(String, Option<String>)> = self
            .map
            .iter()
            .flat_map(|(name, variants)| {
                variants
                    .iter()
                    .filter(|(_, entry)| entry.path() == path)
                    .map(move |(platform, _)| (name.clone(), platform.clone()))
            })
            .collect();
        slots.sort();
        slots
    }

    fn remove_path(&mut self, path: &Path) {
        self.map.retain(|_, variants| {
            variants.retain(|_, entry| entry.path() != path);
            !variants.is_empty()
        });
    }

    fn register(&mut self, registry: &ModuleCache, name: String, entry: HasteEntry) -> Result<()> {
        let platform = platform_extension(entry.path(), registry.platforms());
        let variants = self.map.entry(name.clone()).or_default();
        if let Some(existing) = variants.get(&platform) {
            if existing.path() == entry.path() {
                return Ok(());
            }
            return Err(Error::NamingCollision {
                name,
                platform,
                path: entry.path().to_path_buf(),
                existing: existing.path().to_path_buf(),
            });
        }
        debug!(name = %name, platform = ?platform, path = %entry.path().display(), "Registered haste name");
        variants.insert(platform, entry);
        Ok(())
    }
}

fn detect(registry: &ModuleCache, file: &Path) -> Result<Option<(String, HasteEntry)>> {
    if file.file_name().is_some_and(|n| n == "package.json") {
        let package = registry.get_package(file);
        let is_watch_root = registry.vfs().roots().iter().any(|r| *r == package.root);
        return Ok(match package.name() {
            Some(name) if is_watch_root => {
                Some((name.to_string(), HasteEntry::Package(package.path.clone())))
            }
            _ => None,
        });
    }
    if !file.extension().is_some_and(|e| e == "js") {
        return Ok(None);
    }

    let module = registry.get_module(file);
    if !registry.is_haste(&module)? {
        return Ok(None);
    }
    let name = registry.name(&module)?;
    Ok(Some((name, HasteEntry::Module(module.path.clone()))))
}
