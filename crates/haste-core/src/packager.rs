//! Server-lifetime facade.
//!
//! A [`Packager`] owns the content cache, the dependency graph and the
//! bundler for one server run. It caches built bundles by their options,
//! lets a newer build supersede an older one for the same options, and
//! applies watcher events to every layer in order: graph first, then the
//! transform memo, then the bundle cache.

use crate::bundler::{
    AbortHandle, AssetIndex, Bundle, Bundler, DefaultAssetIndex, HmrBundle, IdentityTransformer,
    PrepackBundle, Transformer,
};
use crate::cache::Cache;
use crate::config::{BundleOptions, GlobalConfig, PackagerOptions};
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, GraphChange};
use crate::registry::{DefaultExtractor, Module, RequireExtractor};
use crate::resolver::ResolutionResponse;
use crate::vfs::FileChange;
use crate::watch::{ChangeType, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Quiet period after the last raw event before a batch is applied.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Pluggable pieces of the pipeline.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub transformer: Arc<dyn Transformer>,
    pub extractor: Arc<dyn RequireExtractor>,
    pub assets: Arc<dyn AssetIndex>,
}

impl Collaborators {
    /// Identity transformer, regex require extraction and the default
    /// asset index.
    #[must_use]
    pub fn defaults(opts: &PackagerOptions) -> Self {
        Self {
            transformer: Arc::new(IdentityTransformer),
            extractor: Arc::new(DefaultExtractor),
            assets: Arc::new(DefaultAssetIndex::new(
                opts.asset_exts.clone(),
                opts.platforms.clone(),
            )),
        }
    }
}

#[derive(Debug)]
enum BundleSlot {
    Building(AbortHandle),
    Built(Arc<Bundle>),
}

impl BundleSlot {
    fn abort(&self) {
        if let Self::Building(abort) = self {
            abort.abort();
        }
    }
}

#[derive(Debug)]
pub struct Packager {
    cache: Arc<Cache>,
    graph: Arc<DependencyGraph>,
    bundler: Bundler,
    bundles: Mutex<FxHashMap<String, BundleSlot>>,
}

impl Packager {
    /// Load the graph with the default collaborators.
    ///
    /// # Errors
    /// See [`Packager::start`].
    pub async fn new(opts: PackagerOptions, global: GlobalConfig) -> Result<Self> {
        let collaborators = Collaborators::defaults(&opts);
        Self::start(opts, global, collaborators).await
    }

    /// Open the cache and run the graph's load chain off the runtime.
    ///
    /// # Errors
    /// Fails if a root is missing, a pattern is invalid, or the initial
    /// haste map has a naming collision.
    pub async fn start(opts: PackagerOptions, global: GlobalConfig, collaborators: Collaborators) -> Result<Self> {
        let cache = Arc::new(match &opts.cache_dir {
            Some(dir) => {
                let key = Cache::version_key(
                    &opts.cache_version,
                    &opts.project_roots,
                    opts.transformer_path.as_deref(),
                );
                Cache::persistent(dir, key, opts.reset_cache)
            }
            None => Cache::in_memory(),
        });

        let graph_cache = Arc::clone(&cache);
        let Collaborators {
            transformer,
            extractor,
            assets,
        } = collaborators;
        let graph = tokio::task::spawn_blocking(move || {
            DependencyGraph::load(opts, global, graph_cache, extractor, assets)
        })
        .await
        .map_err(|e| Error::internal(format!("Graph load task failed: {e}")))??;
        let graph = Arc::new(graph);

        Ok(Self {
            cache,
            bundler: Bundler::new(Arc::clone(&graph), transformer),
            graph,
            bundles: Mutex::new(FxHashMap::default()),
        })
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    #[must_use]
    pub fn bundler(&self) -> &Bundler {
        &self.bundler
    }

    /// Build a bundle, or return the cached one for the same options.
    ///
    /// A build already running for these options is aborted in favor of
    /// this one. Failed builds are never cached.
    ///
    /// # Errors
    /// Any build error, including `Aborted` when superseded.
    pub async fn build_bundle(&self, opts: &BundleOptions) -> Result<Arc<Bundle>> {
        let key = opts.cache_key();
        let abort = AbortHandle::new();
        {
            let mut bundles = self.bundles.lock().unwrap();
            if let Some(BundleSlot::Built(bundle)) = bundles.get(&key) {
                debug!(entry = %opts.entry_file.display(), "Serving cached bundle");
                return Ok(Arc::clone(bundle));
            }
            if let Some(previous) = bundles.insert(key.clone(), BundleSlot::Building(abort.clone())) {
                debug!(entry = %opts.entry_file.display(), "Superseding in-flight build");
                previous.abort();
            }
        }

        let result = self.bundler.bundle(opts, &abort).await.map(Arc::new);

        let mut bundles = self.bundles.lock().unwrap();
        let ours = matches!(bundles.get(&key), Some(BundleSlot::Building(current)) if current.same_as(&abort));
        match &result {
            Ok(bundle) if ours => {
                bundles.insert(key, BundleSlot::Built(Arc::clone(bundle)));
            }
            Err(e) if ours => {
                if matches!(e, Error::NotFound { .. }) {
                    debug!(entry = %opts.entry_file.display(), "Evicting bundle for missing entry");
                }
                bundles.remove(&key);
            }
            _ => {}
        }
        result
    }

    /// # Errors
    /// Any build error.
    pub async fn prepack_bundle(&self, opts: &BundleOptions) -> Result<PrepackBundle> {
        self.bundler.prepack_bundle(opts, &AbortHandle::new()).await
    }

    /// # Errors
    /// Any build error.
    pub async fn bundle_for_hmr(&self, opts: &BundleOptions, changed: &[PathBuf]) -> Result<HmrBundle> {
        self.bundler.bundle_for_hmr(opts, changed).await
    }

    /// Ordered dependencies for `opts`, polyfills included.
    ///
    /// # Errors
    /// Any resolution error.
    pub async fn get_dependencies(&self, opts: &BundleOptions) -> Result<ResolutionResponse> {
        let entry = self.graph.entry_path(&opts.entry_file)?;
        let platform = self.graph.resolve_platform(opts.platform.as_deref(), &entry)?;
        self.bundler
            .get_dependencies(&entry, platform.as_deref(), opts.dev, opts.unbundle)
            .await
    }

    /// # Errors
    /// Any resolution error.
    pub async fn get_ordered_dependency_paths(&self, opts: &BundleOptions) -> Result<Vec<PathBuf>> {
        self.bundler.get_ordered_dependency_paths(opts).await
    }

    /// # Errors
    /// `NotFound` for a missing entry.
    pub fn get_shallow_dependencies(&self, entry: &Path) -> Result<Vec<String>> {
        self.graph.get_shallow_dependencies(entry)
    }

    #[must_use]
    pub fn get_module_for_path(&self, path: &Path) -> Arc<Module> {
        self.graph.get_module_for_path(path)
    }

    /// Drop every module and bundle and rebuild the haste map.
    ///
    /// # Errors
    /// Fails if the rebuilt haste map has a naming collision.
    pub fn refresh_module_cache(&self) -> Result<()> {
        self.graph.refresh()?;
        self.cache.clear();
        self.drop_bundles(|_| true);
        Ok(())
    }

    #[must_use]
    pub fn debug_dump(&self) -> String {
        self.graph.debug_dump()
    }

    /// Number of cached or in-flight bundles.
    #[must_use]
    pub fn bundle_count(&self) -> usize {
        self.bundles.lock().unwrap().len()
    }

    /// Apply one watcher event.
    ///
    /// Bundles that contain a changed file are dropped. An added or deleted
    /// path drops bundles with a module next to it or below it, or every
    /// bundle when the haste map changed. In-flight builds lose their slot so
    /// their result is not cached.
    pub fn process_file_change(&self, event: &WatchEvent) -> Option<GraphChange> {
        let change = self.graph.process_file_change(event)?;
        let GraphChange {
            change: FileChange { kind, ref path },
            haste_changed,
        } = change;
        self.bundler.invalidate_file(path);

        let is_package_json = path.file_name().is_some_and(|n| n == "package.json");
        let drop_all = haste_changed || is_package_json;
        let dropped = self.drop_bundles(|bundle| {
            if drop_all {
                return true;
            }
            match kind {
                ChangeType::Change => bundle.modules().iter().any(|m| m.source_path == *path),
                ChangeType::Add | ChangeType::Delete => {
                    let dir = path.parent();
                    bundle
                        .modules()
                        .iter()
                        .any(|m| {
                            !m.is_virtual
                                && (m.source_path.parent() == dir || m.source_path.starts_with(path))
                        })
                }
            }
        });
        debug!(
            path = %path.display(),
            ?kind,
            haste_changed,
            dropped,
            "Applied file change"
        );
        Some(change)
    }

    /// Remove every building slot and every built bundle matching
    /// `affected`. Returns how many were removed.
    fn drop_bundles<F>(&self, affected: F) -> usize
    where
        F: Fn(&Bundle) -> bool,
    {
        let mut bundles = self.bundles.lock().unwrap();
        let before = bundles.len();
        bundles.retain(|_, slot| match slot {
            BundleSlot::Building(_) => false,
            BundleSlot::Built(bundle) => !affected(bundle),
        });
        before - bundles.len()
    }

    /// Apply watcher events until the channel closes, coalescing bursts.
    ///
    /// Events are applied once no new event arrived for
    /// [`COALESCE_WINDOW`]. Duplicate events within a batch are applied once.
    pub async fn watch(&self, mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
        let mut pending: Vec<WatchEvent> = Vec::new();
        let mut seen: FxHashSet<(ChangeType, PathBuf)> = FxHashSet::default();
        let mut last_event_time = Instant::now();

        loop {
            match tokio::time::timeout(COALESCE_WINDOW, rx.recv()).await {
                Ok(Some(event)) => {
                    if seen.insert((event.kind, event.absolute_path())) {
                        pending.push(event);
                    }
                    last_event_time = Instant::now();
                }
                Ok(None) => {
                    self.apply_batch(&mut pending);
                    debug!("Watch event channel closed");
                    break;
                }
                Err(_) => {
                    if !pending.is_empty() && last_event_time.elapsed() >= COALESCE_WINDOW {
                        self.apply_batch(&mut pending);
                        seen.clear();
                    }
                }
            }
        }
    }

    fn apply_batch(&self, pending: &mut Vec<WatchEvent>) {
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Processing coalesced file events");
        let applied = pending
            .drain(..)
            .filter_map(|event| self.process_file_change(&event))
            .count();
        if applied > 0 {
            info!(count = applied, "Applied file changes");
        }
    }

    /// Abort in-flight builds and persist the content cache.
    ///
    /// # Errors
    /// Returns an error if the cache cannot be written.
    pub fn shutdown(&self) -> Result<()> {
        for slot in self.bundles.lock().unwrap().values() {
            slot.abort();
        }
        if let Err(e) = self.cache.persist() {
            warn!(error = %e, "Failed to persist cache");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::FileWatcher;
    use std::fs;
    use tempfile::tempdir;

    async fn packager(root: &Path) -> Packager {
        Packager::new(
            PackagerOptions::new(vec![root.to_path_buf()]),
            GlobalConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bundles_are_cached_until_a_member_changes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./a');").unwrap();
        fs::write(dir.path().join("a.js"), "a(1);").unwrap();
        fs::write(dir.path().join("other.js"), "").unwrap();
        let p = packager(dir.path()).await;
        let opts = BundleOptions::new("index.js");

        let first = p.build_bundle(&opts).await.unwrap();
        let second = p.build_bundle(&opts).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let event = WatchEvent::for_path(ChangeType::Change, &dir.path().join("other.js"), &[dir.path().to_path_buf()])
            .unwrap();
        p.process_file_change(&event).unwrap();
        assert_eq!(p.bundle_count(), 1);

        fs::write(dir.path().join("a.js"), "a(2);").unwrap();
        let event = WatchEvent::for_path(ChangeType::Change, &dir.path().join("a.js"), &[dir.path().to_path_buf()])
            .unwrap();
        p.process_file_change(&event).unwrap();
        assert_eq!(p.bundle_count(), 0);

        let third = p.build_bundle(&opts).await.unwrap();
        assert!(third.source(false).contains("a(2);"));
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_cached() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        let p = packager(dir.path()).await;

        let err = p.build_bundle(&BundleOptions::new("missing.js")).await.unwrap_err();
        assert_eq!(err.kind(), "NotFoundError");
        assert_eq!(p.bundle_count(), 0);
    }

    #[tokio::test]
    async fn test_added_sibling_drops_bundle() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./later');").unwrap();
        let p = packager(dir.path()).await;
        let opts = BundleOptions::new("index.js").with_platform("android");

        let before = p.build_bundle(&opts).await.unwrap();
        assert_eq!(before.module_paths(), vec![dir.path().join("index.js")]);

        fs::write(dir.path().join("later.js"), "").unwrap();
        let event = WatchEvent::for_path(ChangeType::Add, &dir.path().join("later.js"), &[dir.path().to_path_buf()])
            .unwrap();
        p.process_file_change(&event).unwrap();
        assert_eq!(p.bundle_count(), 0);

        let after = p.build_bundle(&opts).await.unwrap();
        assert!(after.module_paths().contains(&dir.path().join("later.js")));
    }

    #[tokio::test]
    async fn test_package_main_edit_rebuilds_with_new_main() {
        let dir = tempdir().unwrap();
        let lib = dir.path().join("node_modules/lib");
        fs::create_dir_all(&lib).unwrap();
        fs::write(dir.path().join("index.js"), "require('lib');").unwrap();
        fs::write(lib.join("package.json"), r#"{"name": "lib", "main": "a.js"}"#).unwrap();
        fs::write(lib.join("a.js"), "").unwrap();
        fs::write(lib.join("b.js"), "").unwrap();
        let p = packager(dir.path()).await;
        let opts = BundleOptions::new("index.js");

        let before = p.build_bundle(&opts).await.unwrap();
        assert!(before.module_paths().contains(&lib.join("a.js")));

        fs::write(lib.join("package.json"), r#"{"name": "lib", "main": "b.js"}"#).unwrap();
        let event = WatchEvent::for_path(ChangeType::Change, &lib.join("package.json"), &[dir.path().to_path_buf()])
            .unwrap();
        let change = p.process_file_change(&event).unwrap();
        assert_eq!(change.change.path, lib.join("package.json"));
        assert_eq!(p.bundle_count(), 0);

        let after = p.build_bundle(&opts).await.unwrap();
        assert!(after.module_paths().contains(&lib.join("b.js")));
        assert!(!after.module_paths().contains(&lib.join("a.js")));
    }

    #[tokio::test]
    async fn test_watch_loop_applies_forwarded_events() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "x(1);").unwrap();
        let p = packager(dir.path()).await;
        let opts = BundleOptions::new("index.js");
        p.build_bundle(&opts).await.unwrap();

        let (watcher, rx) = FileWatcher::dummy(&[dir.path().to_path_buf()]);
        let tx = watcher.sender();
        fs::write(dir.path().join("index.js"), "x(2);").unwrap();
        let event = WatchEvent::for_path(ChangeType::Change, &dir.path().join("index.js"), watcher.roots())
            .unwrap();
        tx.send(event.clone()).unwrap();
        tx.send(event).unwrap();
        drop(tx);
        drop(watcher);

        p.watch(rx).await;
        assert_eq!(p.bundle_count(), 0);
        assert!(p.build_bundle(&opts).await.unwrap().source(false).contains("x(2);"));
    }

    #[tokio::test]
    async fn test_persistent_cache_survives_restart() {
        let dir = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        let opts = PackagerOptions::new(vec![dir.path().to_path_buf()]).with_cache_dir(cache_dir.path().to_path_buf());

        let p = Packager::new(opts.clone(), GlobalConfig::default()).await.unwrap();
        p.build_bundle(&BundleOptions::new("index.js")).await.unwrap();
        p.shutdown().unwrap();
        assert_eq!(fs::read_dir(cache_dir.path()).unwrap().count(), 1);

        let restarted = Packager::new(opts, GlobalConfig::default()).await.unwrap();
        assert!(!restarted.cache.is_empty());
    }
}
