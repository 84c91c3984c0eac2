//! Bundler: turns an ordered dependency list into a bundle.
//!
//! Every build resolves the entry, prepends the polyfill chain, loads all
//! modules concurrently (transforming sources through the injected
//! [`Transformer`], generating code for null, JSON and asset modules) and
//! then wraps each one in its registration call with rewritten requires.
//! The prepack and hot-update variants share the loading step.

pub mod assets;
mod bundle;
mod hmr;
mod polyfills;
mod prepack;
mod source_map;
mod transform;
mod wrap;

pub use assets::{image_dimensions, AssetData, AssetIndex, DefaultAssetIndex};
pub use bundle::{Bundle, ModuleTransport};
pub use hmr::HmrBundle;
pub use polyfills::{polyfill_modules, POLYFILL_DIR};
pub use prepack::PrepackBundle;
pub use transform::{IdentityTransformer, TransformOptions, Transformed, Transformer};
pub use wrap::{accept_module, define_module, resolve_requires, wrap_polyfill};

use crate::config::BundleOptions;
use crate::error::{Error, Result, TransformError};
use crate::graph::DependencyGraph;
use crate::registry::{Module, ModuleKind, NULL_MODULE_CODE};
use crate::resolver::ResolutionResponse;
use futures::future::try_join_all;
use haste_util::fs::{normalize, relative_slash};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Cancels an in-flight build. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles share one flag.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn check(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(Error::Aborted);
        }
        Ok(())
    }
}

/// A module's code before wrapping.
#[derive(Debug)]
struct LoadedModule {
    name: String,
    code: String,
    map: Option<Value>,
    source_code: String,
    source_path: PathBuf,
    is_virtual: bool,
    is_polyfill: bool,
    asset: Option<Value>,
}

impl LoadedModule {
    fn into_transport(self, code: String, wrapped: bool, dependencies: BTreeMap<String, String>) -> ModuleTransport {
        ModuleTransport {
            name: self.name,
            code,
            map: self.map,
            source_code: self.source_code,
            source_path: self.source_path,
            is_virtual: self.is_virtual,
            wrapped,
            dependencies,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bundler {
    graph: Arc<DependencyGraph>,
    transformer: Arc<dyn Transformer>,
    transform_timeout: Duration,
}

impl Bundler {
    #[must_use]
    pub fn new(graph: Arc<DependencyGraph>, transformer: Arc<dyn Transformer>) -> Self {
        let transform_timeout = graph.options().transform_timeout();
        Self {
            graph,
            transformer,
            transform_timeout,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Drop memoized transforms of `path`.
    pub fn invalidate_file(&self, path: &Path) {
        if self.graph.registry().cache().invalidate(path) {
            debug!(path = %path.display(), "Invalidated transform cache");
        }
    }

    /// Ordered dependencies of `entry` with the polyfill chain prepended.
    /// The response is finalized.
    ///
    /// # Errors
    /// Any resolution error, or a polyfill file that cannot be read.
    pub async fn get_dependencies(
        &self,
        entry: &Path,
        platform: Option<&str>,
        dev: bool,
        unbundle: bool,
    ) -> Result<ResolutionResponse> {
        let graph = Arc::clone(&self.graph);
        let entry = entry.to_path_buf();
        let owned_platform = platform.map(String::from);
        let mut response = tokio::task::spawn_blocking(move || {
            graph.get_dependencies(&entry, owned_platform.as_deref())
        })
        .await
        .map_err(|e| Error::internal(format!("Resolution task failed: {e}")))??;

        let polyfills = polyfill_modules(
            self.graph.registry(),
            dev,
            unbundle,
            &self.graph.options().polyfills,
        )?;
        for polyfill in polyfills.into_iter().rev() {
            response.prepend_dependency(polyfill)?;
        }
        response.finalize()?;
        Ok(response)
    }

    async fn resolve_request(&self, opts: &BundleOptions) -> Result<(ResolutionResponse, TransformOptions)> {
        let entry = self.graph.entry_path(&opts.entry_file)?;
        let platform = self.graph.resolve_platform(opts.platform.as_deref(), &entry)?;
        let response = self
            .get_dependencies(&entry, platform.as_deref(), opts.dev, opts.unbundle)
            .await?;
        let transform_opts = TransformOptions {
            platform,
            dev: opts.dev,
            minify: opts.minify,
        };
        Ok((response, transform_opts))
    }

    /// Build a bundle for `opts`.
    ///
    /// # Errors
    /// `Aborted` once `abort` fires, the first `TransformError`, or any
    /// resolution error.
    pub async fn bundle(&self, opts: &BundleOptions, abort: &AbortHandle) -> Result<Bundle> {
        let start = Instant::now();
        abort.check()?;
        let (response, transform_opts) = self.resolve_request(opts).await?;
        abort.check()?;

        let loaded = try_join_all(
            response
                .dependencies
                .iter()
                .map(|module| self.load_module(module, &transform_opts, abort)),
        )
        .await?;
        abort.check()?;

        let mut bundle = Bundle::new(None);
        for (module, loaded) in response.dependencies.iter().zip(loaded) {
            let asset = loaded.asset.clone();
            let transport = if loaded.is_polyfill {
                let code = wrap_polyfill(&loaded.code);
                loaded.into_transport(code, false, BTreeMap::new())
            } else {
                let resolved = self.resolved_names(&response, module)?;
                let code = define_module(&loaded.name, &resolve_requires(&loaded.code, &resolved));
                loaded.into_transport(code, true, BTreeMap::new())
            };
            if let Some(asset) = asset {
                bundle.add_asset(asset);
            }
            bundle.add_module(transport)?;
        }
        if let Some(main) = &response.main_module_id {
            bundle.set_main_module_id(main.clone());
        }
        bundle.set_num_prepended_modules(response.num_prepended_dependencies);
        bundle.finalize(opts.run_module, &opts.run_before_main_module)?;

        info!(
            entry = %opts.entry_file.display(),
            modules = response.dependencies.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Built bundle"
        );
        Ok(bundle)
    }

    /// Build a bundle whose modules keep their dependency maps and
    /// unrewritten code.
    ///
    /// # Errors
    /// Same as [`Bundler::bundle`].
    pub async fn prepack_bundle(&self, opts: &BundleOptions, abort: &AbortHandle) -> Result<PrepackBundle> {
        let start = Instant::now();
        abort.check()?;
        let (response, transform_opts) = self.resolve_request(opts).await?;

        let loaded = try_join_all(
            response
                .dependencies
                .iter()
                .map(|module| self.load_module(module, &transform_opts, abort)),
        )
        .await?;
        abort.check()?;

        let mut bundle = PrepackBundle::new();
        for (module, loaded) in response.dependencies.iter().zip(loaded) {
            if loaded.is_polyfill {
                bundle.add_polyfill(loaded.code)?;
                continue;
            }
            let dependencies: BTreeMap<String, String> = self.resolved_names(&response, module)?.into_iter().collect();
            let code = loaded.code.clone();
            bundle.add_module(loaded.into_transport(code, false, dependencies))?;
        }
        bundle.finalize(response.main_module_id.clone())?;

        info!(
            entry = %opts.entry_file.display(),
            modules = response.dependencies.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Built prepack bundle"
        );
        Ok(bundle)
    }

    /// Re-transform only `changed` and wrap each as an accept patch.
    ///
    /// Paths that are not part of the entry's graph are skipped.
    ///
    /// # Errors
    /// Same as [`Bundler::bundle`].
    pub async fn bundle_for_hmr(&self, opts: &BundleOptions, changed: &[PathBuf]) -> Result<HmrBundle> {
        let (response, transform_opts) = self.resolve_request(opts).await?;
        let abort = AbortHandle::new();

        let mut hmr = HmrBundle::new();
        for path in changed {
            let path = normalize(path);
            let Some(module) = response.dependencies.iter().find(|m| m.path == path) else {
                debug!(path = %path.display(), "Changed file is not in the bundle");
                continue;
            };
            let loaded = self.load_module(module, &transform_opts, &abort).await?;
            let resolved = self.resolved_names(&response, module)?;
            let code = accept_module(&loaded.name, &resolve_requires(&loaded.code, &resolved));
            hmr.add_module(loaded.into_transport(code, true, BTreeMap::new()));
        }
        Ok(hmr)
    }

    /// File paths of the bundle's modules in order. Assets expand to all of
    /// their variant files; polyfills and null modules are left out.
    ///
    /// # Errors
    /// Any resolution error, or an asset whose variants cannot be hashed.
    pub async fn get_ordered_dependency_paths(&self, opts: &BundleOptions) -> Result<Vec<PathBuf>> {
        let (response, transform_opts) = self.resolve_request(opts).await?;
        let mut paths = Vec::with_capacity(response.dependencies.len());
        for module in &response.dependencies {
            if module.is_virtual() {
                continue;
            }
            if module.is_asset() {
                let data = self.graph.assets().asset_data(
                    &module.path,
                    transform_opts.platform.as_deref(),
                    self.graph.vfs(),
                )?;
                paths.extend(data.files);
            } else {
                paths.push(module.path.clone());
            }
        }
        Ok(paths)
    }

    fn resolved_names(&self, response: &ResolutionResponse, module: &Module) -> Result<FxHashMap<String, String>> {
        let registry = self.graph.registry();
        response
            .resolved_dependency_pairs(module)
            .iter()
            .map(|(name, dep)| Ok((name.clone(), registry.name(dep)?)))
            .collect()
    }

    async fn load_module(
        &self,
        module: &Arc<Module>,
        opts: &TransformOptions,
        abort: &AbortHandle,
    ) -> Result<LoadedModule> {
        abort.check()?;
        let name = self.graph.registry().name(module)?;
        let generated = |code: String| LoadedModule {
            name: name.clone(),
            source_code: code.clone(),
            code,
            map: None,
            source_path: module.path.clone(),
            is_virtual: true,
            is_polyfill: false,
            asset: None,
        };

        match &module.kind {
            ModuleKind::Null { .. } => Ok(generated(NULL_MODULE_CODE.to_string())),
            ModuleKind::Polyfill { code, .. } => Ok(LoadedModule {
                is_polyfill: true,
                ..generated(code.to_string())
            }),
            ModuleKind::Asset { resolution, .. } => {
                let descriptor = self.asset_descriptor(module, *resolution, opts.platform.clone()).await?;
                let code = format!("module.exports = require(\"AssetRegistry\").registerAsset({descriptor});");
                Ok(LoadedModule {
                    asset: Some(descriptor),
                    ..generated(code)
                })
            }
            ModuleKind::Source if module.is_json() => {
                let content = self.graph.vfs().read_file(&module.path)?;
                Ok(generated(format!("module.exports = {};", content.trim_end())))
            }
            ModuleKind::Source => {
                let transformed = self.transform(module, opts).await?;
                Ok(LoadedModule {
                    name: name.clone(),
                    code: transformed.code,
                    map: transformed.map,
                    source_code: transformed.source_code,
                    source_path: transformed.source_path,
                    is_virtual: false,
                    is_polyfill: false,
                    asset: None,
                })
            }
        }
    }

    /// Run the transformer off the runtime, memoized per option set.
    async fn transform(&self, module: &Arc<Module>, opts: &TransformOptions) -> Result<Transformed> {
        let graph = Arc::clone(&self.graph);
        let transformer = Arc::clone(&self.transformer);
        let path = module.path.clone();
        let opts = opts.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<Transformed> {
            let registry = graph.registry();
            registry.cache().get(&path, &opts.cache_field(), || {
                let source = registry.vfs().read_file(&path)?;
                transformer.transform(&path, &source, &opts).map_err(Error::from)
            })
        });

        match tokio::time::timeout(self.transform_timeout, task).await {
            Ok(joined) => joined.map_err(|e| Error::internal(format!("Transform task failed: {e}")))?,
            Err(_) => Err(TransformError::new(
                module.path.clone(),
                format!(
                    "Transform timed out after {}ms",
                    self.transform_timeout.as_millis()
                ),
            )
            .into()),
        }
    }

    async fn asset_descriptor(&self, module: &Arc<Module>, resolution: f32, platform: Option<String>) -> Result<Value> {
        let graph = Arc::clone(&self.graph);
        let path = module.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Value> {
            let data = graph.assets().asset_data(&path, platform.as_deref(), graph.vfs())?;
            let dir = path.parent().unwrap_or(&path);
            let rel_dir = graph
                .vfs()
                .roots()
                .iter()
                .find_map(|root| relative_slash(root, dir))
                .unwrap_or_default();
            let http_location = if rel_dir.is_empty() {
                "/assets".to_string()
            } else {
                format!("/assets/{rel_dir}")
            };
            let (width, height) = match image_dimensions(&path) {
                Some((w, h)) => (
                    Some(f64::from(w) / f64::from(resolution)),
                    Some(f64::from(h) / f64::from(resolution)),
                ),
                None => (None, None),
            };
            Ok(json!({
                "__packager_asset": true,
                "fileSystemLocation": dir,
                "httpServerLocation": http_location,
                "width": width,
                "height": height,
                "scales": data.scales,
                "files": data.files,
                "hash": data.hash,
                "name": data.name,
                "type": data.asset_type,
            }))
        })
        .await
        .map_err(|e| Error::internal(format!("Asset task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::{GlobalConfig, PackagerOptions};
    use crate::registry::DefaultExtractor;
    use crate::watch::{ChangeType, WatchEvent};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Debug, Default)]
    struct CountingTransformer {
        calls: AtomicUsize,
    }

    impl Transformer for CountingTransformer {
        fn transform(&self, path: &Path, source: &str, opts: &TransformOptions) -> std::result::Result<Transformed, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if source.contains("SYNTAX ERROR") {
                return Err(TransformError::new(path, "Unexpected token").at(1, 7));
            }
            IdentityTransformer.transform(path, source, opts)
        }
    }

    #[derive(Debug)]
    struct SlowTransformer;

    impl Transformer for SlowTransformer {
        fn transform(&self, path: &Path, source: &str, opts: &TransformOptions) -> std::result::Result<Transformed, TransformError> {
            std::thread::sleep(Duration::from_millis(300));
            IdentityTransformer.transform(path, source, opts)
        }
    }

    fn bundler(transformer: Arc<dyn Transformer>, opts: PackagerOptions) -> Bundler {
        let assets = DefaultAssetIndex::new(opts.asset_exts.clone(), opts.platforms.clone());
        let graph = DependencyGraph::load(
            opts,
            GlobalConfig::default(),
            Arc::new(Cache::in_memory()),
            Arc::new(DefaultExtractor),
            Arc::new(assets),
        )
        .unwrap();
        Bundler::new(Arc::new(graph), transformer)
    }

    fn user_modules(bundle: &Bundle) -> Vec<&ModuleTransport> {
        bundle.modules()[bundle.num_prepended_modules()..].iter().collect()
    }

    #[tokio::test]
    async fn test_bundle_wraps_and_rewrites() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "var Foo = require('./Foo');").unwrap();
        fs::write(dir.path().join("Foo.js"), "module.exports = 1;").unwrap();
        let b = bundler(
            Arc::new(IdentityTransformer),
            PackagerOptions::new(vec![dir.path().to_path_buf()]),
        );

        let bundle = b
            .bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap();
        let user = user_modules(&bundle);
        assert_eq!(user[0].name, "index.js");
        assert!(user[0].code.starts_with("__d(\"index.js\""));
        assert!(user[0].code.contains("require('Foo.js')"));
        assert_eq!(user[1].name, "Foo.js");
        assert_eq!(bundle.main_module_id(), Some("index.js"));
        assert!(bundle.source(false).ends_with(";require(\"index.js\");"));
        assert!(bundle.modules()[0].code.starts_with("(function(global)"));
    }

    #[tokio::test]
    async fn test_json_module() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./data.json');").unwrap();
        fs::write(dir.path().join("data.json"), "{\"a\": 1}\n").unwrap();
        let b = bundler(
            Arc::new(IdentityTransformer),
            PackagerOptions::new(vec![dir.path().to_path_buf()]),
        );

        let bundle = b
            .bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap();
        let json = user_modules(&bundle)[1];
        assert!(json.is_virtual);
        assert!(json.code.contains("module.exports = {\"a\": 1};"));
    }

    #[tokio::test]
    async fn test_transform_error_fails_build_and_memo_is_reused() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./bad');").unwrap();
        fs::write(dir.path().join("bad.js"), "SYNTAX ERROR").unwrap();
        let transformer = Arc::new(CountingTransformer::default());
        let b = bundler(
            transformer.clone(),
            PackagerOptions::new(vec![dir.path().to_path_buf()]),
        );

        let err = b
            .bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap_err();
        let Error::Transform(e) = err else {
            panic!("expected a transform error, got {err:?}");
        };
        assert_eq!(e.line, Some(1));
        assert!(e.path.ends_with("bad.js"));

        fs::write(dir.path().join("bad.js"), "module.exports = 2;").unwrap();
        let event = WatchEvent::for_path(ChangeType::Change, &dir.path().join("bad.js"), b.graph().vfs().roots())
            .unwrap();
        b.graph().process_file_change(&event).unwrap();
        b.invalidate_file(&event.absolute_path());
        b.bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap();
        let calls = transformer.calls.load(Ordering::SeqCst);
        b.bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap();
        assert_eq!(transformer.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_abort_and_timeout() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        let opts = PackagerOptions::new(vec![dir.path().to_path_buf()])
            .with_transform_timeout(Duration::from_millis(20));
        let b = bundler(Arc::new(SlowTransformer), opts);

        let abort = AbortHandle::new();
        abort.abort();
        let err = b.bundle(&BundleOptions::new("index.js"), &abort).await.unwrap_err();
        assert!(matches!(err, Error::Aborted));

        let err = b
            .bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transform(ref e) if e.description.contains("timed out")));
    }

    #[tokio::test]
    async fn test_prepack_keeps_dependency_maps() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./Foo');").unwrap();
        fs::write(dir.path().join("Foo.js"), "").unwrap();
        let b = bundler(
            Arc::new(IdentityTransformer),
            PackagerOptions::new(vec![dir.path().to_path_buf()]),
        );

        let prepack = b
            .prepack_bundle(&BundleOptions::new("index.js"), &AbortHandle::new())
            .await
            .unwrap();
        assert_eq!(prepack.main_module_id(), Some("index.js"));
        assert!(!prepack.polyfills().is_empty());
        let index = &prepack.modules()[0];
        assert_eq!(index.code, "require('./Foo');");
        assert_eq!(index.dependencies.get("./Foo").map(String::as_str), Some("Foo.js"));
    }

    #[tokio::test]
    async fn test_hmr_only_emits_changed_modules() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./Foo');").unwrap();
        fs::write(dir.path().join("Foo.js"), "require('./index');").unwrap();
        let b = bundler(
            Arc::new(IdentityTransformer),
            PackagerOptions::new(vec![dir.path().to_path_buf()]),
        );

        let hmr = b
            .bundle_for_hmr(
                &BundleOptions::new("index.js"),
                &[dir.path().join("Foo.js"), dir.path().join("elsewhere.js")],
            )
            .await
            .unwrap();
        assert_eq!(hmr.module_names(), vec!["Foo.js"]);
        assert!(hmr.source().starts_with("__accept(\"Foo.js\""));
        assert!(hmr.source().contains("require('index.js')"));
    }

    #[tokio::test]
    async fn test_ordered_paths_skip_virtual_modules() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./a');").unwrap();
        fs::write(dir.path().join("a.js"), "").unwrap();
        let b = bundler(
            Arc::new(IdentityTransformer),
            PackagerOptions::new(vec![dir.path().to_path_buf()]),
        );

        let paths = b
            .get_ordered_dependency_paths(&BundleOptions::new("index.js"))
            .await
            .unwrap();
        assert_eq!(paths, vec![dir.path().join("index.js"), dir.path().join("a.js")]);
    }
}
