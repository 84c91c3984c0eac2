//! Dependency graph orchestrator.
//!
//! Owns the load chain (crawl, virtual filesystem, haste map, asset index)
//! and answers ordered-dependency queries against it. A graph only exists
//! once the chain has finished, so no query ever sees a partial index.

use crate::bundler::assets::AssetIndex;
use crate::cache::Cache;
use crate::config::{GlobalConfig, PackagerOptions};
use crate::error::{Error, Result};
use crate::registry::{platform_extension, HasteMap, Module, ModuleCache, RequireExtractor};
use crate::resolver::{ResolutionRequest, ResolutionResponse};
use crate::vfs::{crawl, FileChange, IgnoreRules, Vfs};
use crate::watch::{ChangeType, WatchEvent};
use haste_util::fs::{is_descendant, normalize};
use rayon::prelude::*;
use regex_lite::Regex;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of applying one watcher event to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphChange {
    pub change: FileChange,
    /// Whether the haste map was modified (or rebuilt).
    pub haste_changed: bool,
}

#[derive(Debug, Default)]
struct LoadState {
    /// Set when an incremental haste update failed; cleared by the next
    /// successful full rebuild.
    haste_error: bool,
}

/// The dependency graph for one server lifetime.
#[derive(Debug)]
pub struct DependencyGraph {
    opts: PackagerOptions,
    global: GlobalConfig,
    asset_exts: Vec<String>,
    registry: ModuleCache,
    haste: RwLock<HasteMap>,
    assets: Arc<dyn AssetIndex>,
    state: Mutex<LoadState>,
    mocks_pattern: Option<Regex>,
}

impl DependencyGraph {
    /// Run the load chain.
    ///
    /// # Errors
    /// Fails if a root is missing, a pattern does not compile, or the haste
    /// map has a naming collision.
    pub fn load(
        opts: PackagerOptions,
        global: GlobalConfig,
        cache: Arc<Cache>,
        extractor: Arc<dyn RequireExtractor>,
        assets: Arc<dyn AssetIndex>,
    ) -> Result<Self> {
        let start = Instant::now();

        let mut ignore = IgnoreRules::from_patterns(&opts.blacklist)
            .map_err(|(pattern, message)| Error::Pattern { pattern, message })?;
        if let Some(re) = &global.ignored_patterns {
            ignore = ignore.with_scoped_regex(re.clone(), opts.internal_roots.clone());
        }
        let mocks_pattern = opts
            .mocks_pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::Pattern {
                    pattern: p.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        let asset_exts = global
            .asset_exts
            .clone()
            .unwrap_or_else(|| opts.asset_exts.clone());
        let mut exts = opts.project_exts.clone();
        for ext in &asset_exts {
            if !exts.contains(ext) {
                exts.push(ext.clone());
            }
        }

        let roots: Vec<PathBuf> = opts.project_roots.iter().map(|r| normalize(r)).collect();
        let files = crawl(&roots, &exts, &ignore)?;
        let vfs = Vfs::build(&roots, files, ignore, exts)?;
        let registry = ModuleCache::new(Arc::new(vfs), cache, extractor, opts.platforms.clone());
        let haste = HasteMap::build(&registry)?;
        assets.build(registry.vfs());

        info!(
            roots = roots.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dependency graph ready"
        );

        Ok(Self {
            opts,
            global,
            asset_exts,
            registry,
            haste: RwLock::new(haste),
            assets,
            state: Mutex::new(LoadState::default()),
            mocks_pattern,
        })
    }

    #[must_use]
    pub fn options(&self) -> &PackagerOptions {
        &self.opts
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleCache {
        &self.registry
    }

    #[must_use]
    pub fn vfs(&self) -> &Vfs {
        self.registry.vfs()
    }

    #[must_use]
    pub fn assets(&self) -> &dyn AssetIndex {
        self.assets.as_ref()
    }

    #[must_use]
    pub fn asset_exts(&self) -> &[String] {
        &self.asset_exts
    }

    #[must_use]
    pub fn has_haste_error(&self) -> bool {
        self.state.lock().unwrap().haste_error
    }

    /// The platform a request runs for.
    ///
    /// An explicit platform must be configured. Without one the entry's
    /// filename decides (`index.ios.js`).
    ///
    /// # Errors
    /// Returns `UnrecognizedPlatform` for an unknown explicit platform.
    pub fn resolve_platform(&self, platform: Option<&str>, entry: &Path) -> Result<Option<String>> {
        match platform {
            Some(p) if self.opts.platforms.iter().any(|known| known == p) => Ok(Some(p.to_string())),
            Some(p) => Err(Error::UnrecognizedPlatform(p.to_string())),
            None => Ok(platform_extension(entry, &self.opts.platforms)),
        }
    }

    /// Absolute path of an entry file.
    ///
    /// Relative entries are looked up in each project root in order.
    ///
    /// # Errors
    /// Returns `NotFound` if no root contains the entry.
    pub fn entry_path(&self, entry: &Path) -> Result<PathBuf> {
        let vfs = self.vfs();
        if entry.is_absolute() {
            let path = normalize(entry);
            if !vfs.roots().iter().any(|root| is_descendant(root, &path)) {
                if let Some(dir) = path.parent().filter(|d| d.is_dir()) {
                    vfs.add_detached_root(dir);
                }
            }
            if vfs.file_exists(&path) {
                return Ok(path);
            }
        } else if let Some(path) = vfs
            .roots()
            .iter()
            .map(|root| normalize(&root.join(entry)))
            .find(|p| vfs.file_exists(p))
        {
            return Ok(path);
        }
        Err(Error::NotFound {
            path: entry.to_path_buf(),
            roots: vfs.roots().to_vec(),
        })
    }

    /// The module for a path, as an asset module when its extension is one.
    #[must_use]
    pub fn get_module_for_path(&self, path: &Path) -> Arc<Module> {
        let is_asset = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.asset_exts.iter().any(|x| x == e));
        if is_asset {
            self.registry.get_asset_module(path)
        } else {
            self.registry.get_module(path)
        }
    }

    /// Declared dependency names of the entry, unresolved.
    ///
    /// # Errors
    /// `NotFound` for a missing entry, or an IO error reading it.
    pub fn get_shallow_dependencies(&self, entry: &Path) -> Result<Vec<String>> {
        let path = self.entry_path(entry)?;
        let module = self.get_module_for_path(&path);
        self.registry.dependencies(&module)
    }

    /// Mock files keyed by basename without extension.
    #[must_use]
    pub fn mocks(&self) -> BTreeMap<String, PathBuf> {
        let Some(pattern) = &self.mocks_pattern else {
            return BTreeMap::new();
        };
        self.vfs()
            .match_files_by_pattern(pattern)
            .into_iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_string_lossy().into_owned();
                Some((stem, path))
            })
            .collect()
    }

    /// Ordered dependencies of `entry`: a pre-order, declaration-ordered
    /// traversal visiting each module once, followed by the entry's async
    /// groups.
    ///
    /// The returned response is not finalized so callers can prepend
    /// polyfills.
    ///
    /// # Errors
    /// `NotFound`, `UnrecognizedPlatform`, an `UnableToResolve` on a platform
    /// where unresolved requires are fatal, or an IO error.
    pub fn get_dependencies(&self, entry: &Path, platform: Option<&str>) -> Result<ResolutionResponse> {
        let start = Instant::now();
        let entry_path = self.entry_path(entry)?;
        let platform = self.resolve_platform(platform, &entry_path)?;
        if self.has_haste_error() {
            warn!("Haste map has a pending error; resolving against the last good map");
        }

        let haste = self.haste.read().unwrap();
        let request = ResolutionRequest::new(
            platform.as_deref(),
            &self.registry,
            &haste,
            self.assets.as_ref(),
            &self.global,
            &self.asset_exts,
        )
        .with_prefer_native(self.opts.prefer_native_platform);
        let fatal = self.opts.is_fatal_unresolved(platform.as_deref());

        let mocks = self.mocks();
        let mut response = ResolutionResponse::new();
        let entry = self.get_module_for_path(&entry_path);
        response.set_main_module_id(self.registry.name(&entry)?)?;

        let mut visited: FxHashSet<_> = FxHashSet::default();
        let mut stack = vec![entry.clone()];
        while let Some(module) = stack.pop() {
            if !visited.insert(module.id) {
                continue;
            }
            response.push_dependency(module.clone())?;

            let names = self.registry.dependencies(&module)?;
            let resolved: Vec<(String, Result<Arc<Module>>)> = names
                .par_iter()
                .map(|name| (name.clone(), request.resolve_dependency(&module, name)))
                .collect();

            let mut pairs: Vec<(String, Arc<Module>)> = Vec::with_capacity(resolved.len() + 1);
            if !mocks.is_empty() {
                let own_name = self.registry.name(&module)?;
                if let Some(mock) = mocks.get(&own_name).filter(|m| **m != module.path) {
                    debug!(name = %own_name, mock = %mock.display(), "Adding mock");
                    pairs.push((own_name, self.registry.get_module(mock)));
                }
            }
            for (name, result) in resolved {
                match result {
                    Ok(dep) => pairs.push((name, dep)),
                    Err(e) if e.is_unable_to_resolve() => {
                        if let Some(mock) = mocks.get(&name) {
                            pairs.push((name, self.registry.get_module(mock)));
                            continue;
                        }
                        if fatal {
                            return Err(e);
                        }
                        warn!(error = %e, "Tolerating unresolved dependency");
                        response.warnings.push(e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }

            for (_, dep) in pairs.iter().rev() {
                if !visited.contains(&dep.id) {
                    stack.push(dep.clone());
                }
            }
            response.set_resolved_pairs(&module, pairs)?;
        }

        for group in self.registry.async_dependencies(&entry)? {
            let mut paths = Vec::with_capacity(group.len());
            for name in &group {
                match request.resolve_dependency(&entry, name) {
                    Ok(dep) => paths.push(dep.path.clone()),
                    Err(e) if e.is_unable_to_resolve() && !fatal => {
                        warn!(error = %e, "Tolerating unresolved async dependency");
                        response.warnings.push(e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }
            if !paths.is_empty() {
                response.push_async_dependency(paths)?;
            }
        }
        response.set_mocks(mocks)?;

        info!(
            entry = %entry_path.display(),
            platform = ?platform,
            modules = response.dependencies.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Resolved dependencies"
        );
        Ok(response)
    }

    /// Apply one watcher event: virtual filesystem first, then the module
    /// registry, then the haste map. Events are serialized.
    ///
    /// Returns `None` when the event is irrelevant.
    pub fn process_file_change(&self, event: &WatchEvent) -> Option<GraphChange> {
        let mut state = self.state.lock().unwrap();
        let removed_files = if event.kind == ChangeType::Delete {
            self.vfs().files_under(&event.absolute_path())
        } else {
            Vec::new()
        };
        let change = self
            .vfs()
            .process_file_change(event.kind, &event.root, &event.relative_path)?;

        // A deleted directory reaches the registry and haste map as one
        // delete per file it contained.
        let file_changes: Vec<FileChange> = if removed_files.is_empty() {
            vec![change.clone()]
        } else {
            debug!(path = %change.path.display(), count = removed_files.len(), "Directory deleted");
            removed_files
                .into_iter()
                .map(|path| FileChange {
                    kind: ChangeType::Delete,
                    path,
                })
                .collect()
        };
        for file_change in &file_changes {
            self.registry.process_file_change(file_change);
        }

        let mut haste = self.haste.write().unwrap();
        let haste_changed = if state.haste_error {
            match HasteMap::build(&self.registry) {
                Ok(map) => {
                    *haste = map;
                    state.haste_error = false;
                    info!("Haste map rebuilt after earlier error");
                }
                Err(e) => warn!(error = %e, "Haste map rebuild failed"),
            }
            true
        } else {
            let mut changed = false;
            for file_change in &file_changes {
                match haste.process_file_change(&self.registry, file_change) {
                    Ok(c) => changed |= c,
                    Err(e) => {
                        state.haste_error = true;
                        warn!(error = %e, path = %file_change.path.display(), "Haste map update failed, full rebuild scheduled");
                        changed = true;
                    }
                }
            }
            changed
        };
        drop(haste);

        // A haste rename or a package.json edit can change what any name
        // resolves to.
        let touches_package = file_changes
            .iter()
            .any(|c| c.path.file_name().is_some_and(|n| n == "package.json"));
        if haste_changed || touches_package {
            debug!(path = %change.path.display(), "Clearing cached resolutions");
            self.registry.clear_resolutions();
        }

        Some(GraphChange {
            change,
            haste_changed,
        })
    }

    /// Drop every cached module and rebuild the haste map.
    ///
    /// # Errors
    /// Fails if the rebuilt haste map has a naming collision.
    pub fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.registry.refresh();
        let map = HasteMap::build(&self.registry)?;
        *self.haste.write().unwrap() = map;
        state.haste_error = false;
        Ok(())
    }

    #[must_use]
    pub fn debug_dump(&self) -> String {
        self.registry.debug_dump()
    }
}
