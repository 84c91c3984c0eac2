//! Dependency resolution.
//!
//! A [`ResolutionRequest`] resolves the names a module requires, for one
//! platform. Resolution goes through these stages in order:
//! - asset lookup for names with an asset extension
//! - the requester's package redirect (`react-native` / `browser` field)
//! - project-wide redirects from the global config
//! - strategies: haste names, relative/absolute paths, `node_modules`,
//!   Node core modules
//!
//! Successful resolutions are memoized in the registry under
//! `(requester, platform, name)`.

mod builtins;
mod response;

pub use builtins::{is_builtin, NODE_BUILTINS};
pub use response::ResolutionResponse;

use crate::bundler::assets::AssetIndex;
use crate::config::{GlobalConfig, RedirectTarget};
use crate::error::{Error, Result};
use crate::registry::{HasteEntry, HasteMap, Module, ModuleCache, Redirect, ResolutionKey};
use haste_util::fs::normalize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Extensions tried, in order, after the platform-specific ones.
const FILE_EXTENSIONS: &[&str] = &[".js", ".jsx", ".json"];

type Strategy<'a> = fn(&ResolutionRequest<'a>, &Module, &str) -> Result<Option<Arc<Module>>>;

/// Resolution context for one platform.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionRequest<'a> {
    platform: Option<&'a str>,
    prefer_native: bool,
    registry: &'a ModuleCache,
    haste: &'a HasteMap,
    assets: &'a dyn AssetIndex,
    global: &'a GlobalConfig,
    asset_exts: &'a [String],
}

impl<'a> ResolutionRequest<'a> {
    #[must_use]
    pub fn new(
        platform: Option<&'a str>,
        registry: &'a ModuleCache,
        haste: &'a HasteMap,
        assets: &'a dyn AssetIndex,
        global: &'a GlobalConfig,
        asset_exts: &'a [String],
    ) -> Self {
        Self {
            platform,
            prefer_native: true,
            registry,
            haste,
            assets,
            global,
            asset_exts,
        }
    }

    #[must_use]
    pub fn with_prefer_native(mut self, prefer: bool) -> Self {
        self.prefer_native = prefer;
        self
    }

    #[must_use]
    pub fn platform(&self) -> Option<&'a str> {
        self.platform
    }

    /// Resolve `name` as required from `from`.
    ///
    /// # Errors
    /// Returns `UnableToResolve` when no stage produces a module, or an IO
    /// error if a file that must be inspected cannot be read.
    pub fn resolve_dependency(&self, from: &Module, name: &str) -> Result<Arc<Module>> {
        let key = ResolutionKey {
            from: from.id,
            platform: self.platform.map(str::to_string),
            name: name.to_string(),
        };
        if let Some(module) = self.registry.resolved(&key) {
            trace!(name, from = %from.path.display(), "Resolution cache hit");
            return Ok(module);
        }

        let module = self.resolve_uncached(from, name)?;
        self.registry.set_resolved(key, &module);
        Ok(module)
    }

    fn resolve_uncached(&self, from: &Module, name: &str) -> Result<Arc<Module>> {
        let from_dir = from.path.parent().unwrap_or(Path::new("/"));

        if self.is_asset_name(name) {
            if let Some(path) =
                self.assets
                    .resolve(from_dir, name, self.platform, self.registry.vfs())
            {
                return Ok(self.registry.get_asset_module(&path));
            }
        }

        let mut name = name.to_string();
        if let Some(package) = self.registry.package_for(from) {
            let lookup = if name.starts_with('.') {
                normalize(&from_dir.join(&name)).to_string_lossy().into_owned()
            } else {
                name.clone()
            };
            match package.redirect_require(&lookup) {
                Redirect::Suppressed => {
                    debug!(name = %name, package = %package.path.display(), "Dependency suppressed by package");
                    return Ok(self.registry.get_null_module(&name));
                }
                Redirect::To(to) => {
                    debug!(from = %name, to = %to, "Package redirect");
                    name = if to.starts_with('.') {
                        normalize(&package.root.join(&to)).to_string_lossy().into_owned()
                    } else {
                        to
                    };
                }
                Redirect::Unchanged => {}
            }
        }

        match self.global.redirect_for(&name) {
            Some(RedirectTarget::Suppress(false)) => {
                debug!(name = %name, "Dependency suppressed by global config");
                return Ok(self.registry.get_null_module(&name));
            }
            Some(RedirectTarget::To(to)) => {
                debug!(from = %name, to = %to, "Global redirect");
                name = to.clone();
            }
            Some(RedirectTarget::Suppress(true)) | None => {}
        }

        let strategies: [(&str, Strategy<'a>); 4] = [
            ("haste", Self::resolve_haste),
            ("path", Self::resolve_path),
            ("node_modules", Self::resolve_node_modules),
            ("builtin", Self::resolve_builtin),
        ];
        for (strategy, resolve) in strategies {
            if let Some(module) = resolve(self, from, &name)? {
                trace!(name = %name, strategy, path = %module.path.display(), "Resolved");
                return Ok(module);
            }
        }

        Err(Error::UnableToResolve {
            from: from.path.clone(),
            name,
            platform: self.platform.map(str::to_string),
        })
    }

    fn is_asset_name(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.asset_exts.iter().any(|x| x == e))
    }

    fn resolve_haste(&self, _from: &Module, name: &str) -> Result<Option<Arc<Module>>> {
        if is_path_like(name) {
            return Ok(None);
        }

        match self.haste.get(name, self.platform) {
            Some(HasteEntry::Module(path)) => return Ok(Some(self.registry.get_module(path))),
            Some(HasteEntry::Package(path)) => {
                let package = self.registry.get_package(path);
                let main = package.main();
                return Ok(self.load_file_or_dir(&main));
            }
            None => {}
        }

        // `pkg/sub/path` where `pkg` is a haste package.
        let mut end = name.len();
        while let Some(slash) = name[..end].rfind('/') {
            end = slash;
            if let Some(HasteEntry::Package(path)) = self.haste.get(&name[..end], self.platform) {
                let root = path.parent().unwrap_or(Path::new("/"));
                let candidate = normalize(&root.join(&name[end + 1..]));
                return Ok(self.load_file_or_dir(&candidate));
            }
        }
        Ok(None)
    }

    fn resolve_path(&self, from: &Module, name: &str) -> Result<Option<Arc<Module>>> {
        if !is_path_like(name) {
            return Ok(None);
        }
        let path = if name.starts_with('/') {
            normalize(Path::new(name))
        } else {
            let from_dir = from.path.parent().unwrap_or(Path::new("/"));
            normalize(&from_dir.join(name))
        };
        Ok(self.load_file_or_dir(&path))
    }

    fn resolve_node_modules(&self, from: &Module, name: &str) -> Result<Option<Arc<Module>>> {
        if is_path_like(name) {
            return Ok(None);
        }
        let from_dir = from.path.parent().unwrap_or(Path::new("/"));
        for dir in from_dir.ancestors() {
            if dir.file_name().is_some_and(|n| n == "node_modules") {
                continue;
            }
            let candidate = dir.join("node_modules").join(name);
            if let Some(module) = self.load_file_or_dir(&candidate) {
                return Ok(Some(module));
            }
        }
        Ok(None)
    }

    fn resolve_builtin(&self, _from: &Module, name: &str) -> Result<Option<Arc<Module>>> {
        if is_builtin(name) {
            debug!(name, "Core module resolved to a null module");
            return Ok(Some(self.registry.get_null_module(name)));
        }
        Ok(None)
    }

    fn load_file_or_dir(&self, path: &Path) -> Option<Arc<Module>> {
        let file = self
            .load_as_file(path)
            .or_else(|| self.load_as_dir(path))?;
        Some(self.module_for_file(&file))
    }

    fn module_for_file(&self, path: &Path) -> Arc<Module> {
        if self.is_asset_name(&path.to_string_lossy()) {
            self.registry.get_asset_module(path)
        } else {
            self.registry.get_module(path)
        }
    }

    /// Try `path` itself, then platform, native and plain extensions.
    fn load_as_file(&self, path: &Path) -> Option<PathBuf> {
        let vfs = self.registry.vfs();
        if vfs.file_exists(path) {
            return Some(path.to_path_buf());
        }

        let mut suffixes: Vec<String> = Vec::with_capacity(5);
        if let Some(platform) = self.platform {
            suffixes.push(format!(".{platform}.js"));
        }
        if self.prefer_native {
            suffixes.push(".native.js".to_string());
        }
        suffixes.extend(FILE_EXTENSIONS.iter().map(|e| (*e).to_string()));

        suffixes
            .into_iter()
            .map(|suffix| with_suffix(path, &suffix))
            .find(|candidate| vfs.file_exists(candidate))
    }

    /// `package.json` main (as a file, then as a directory), else `index`.
    fn load_as_dir(&self, dir: &Path) -> Option<PathBuf> {
        let vfs = self.registry.vfs();
        if !vfs.dir_exists(dir) {
            return None;
        }

        let package_json = dir.join("package.json");
        if vfs.file_exists(&package_json) {
            let main = self.registry.get_package(&package_json).main();
            if main != dir {
                if let Some(file) = self.load_as_file(&main) {
                    return Some(file);
                }
                if let Some(file) = self.load_as_dir(&main) {
                    return Some(file);
                }
            }
        }
        self.load_as_file(&dir.join("index"))
    }
}

fn is_path_like(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('/')
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::assets::DefaultAssetIndex;
    use crate::cache::Cache;
    use crate::registry::{DefaultExtractor, NULL_MODULE_CODE};
    use crate::vfs::{crawl, IgnoreRules, Vfs};
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        registry: ModuleCache,
        haste: HasteMap,
        assets: DefaultAssetIndex,
        global: GlobalConfig,
        asset_exts: Vec<String>,
    }

    impl Fixture {
        fn new(roots: &[PathBuf]) -> Self {
            let asset_exts = vec!["png".to_string()];
            let exts: Vec<String> = vec!["js".into(), "json".into(), "png".into()];
            let files = crawl(roots, &exts, &IgnoreRules::default()).unwrap();
            let vfs = Vfs::build(roots, files, IgnoreRules::default(), exts).unwrap();
            let platforms = vec!["ios".to_string(), "android".to_string()];
            let registry = ModuleCache::new(
                Arc::new(vfs),
                Arc::new(Cache::in_memory()),
                Arc::new(DefaultExtractor),
                platforms.clone(),
            );
            let haste = HasteMap::build(&registry).unwrap();
            Self {
                registry,
                haste,
                assets: DefaultAssetIndex::new(asset_exts.clone(), platforms),
                global: GlobalConfig::default(),
                asset_exts,
            }
        }

        fn request(&self, platform: Option<&'static str>) -> ResolutionRequest<'_> {
            ResolutionRequest::new(
                platform,
                &self.registry,
                &self.haste,
                &self.assets,
                &self.global,
                &self.asset_exts,
            )
        }
    }

    #[test]
    fn test_relative_with_platform_variants() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "require('./Foo');").unwrap();
        fs::write(dir.path().join("Foo.js"), "").unwrap();
        fs::write(dir.path().join("Foo.ios.js"), "").unwrap();
        fs::write(dir.path().join("Foo.native.js"), "").unwrap();
        let fx = Fixture::new(&[dir.path().to_path_buf()]);
        let index = fx.registry.get_module(&dir.path().join("index.js"));

        let ios = fx.request(Some("ios")).resolve_dependency(&index, "./Foo").unwrap();
        assert_eq!(ios.path, dir.path().join("Foo.ios.js"));

        let android = fx.request(Some("android")).resolve_dependency(&index, "./Foo").unwrap();
        assert_eq!(android.path, dir.path().join("Foo.native.js"));

        let plain = fx
            .request(Some("android"))
            .with_prefer_native(false)
            .resolve_dependency(&index, "./Foo.js")
            .unwrap();
        assert_eq!(plain.path, dir.path().join("Foo.js"));
    }

    #[test]
    fn test_directory_and_node_modules() {
        let dir = tempdir().unwrap();
        let lib = dir.path().join("node_modules/lib");
        fs::create_dir_all(lib.join("src")).unwrap();
        fs::create_dir_all(dir.path().join("utils")).unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        fs::write(dir.path().join("utils/index.js"), "").unwrap();
        fs::write(lib.join("package.json"), r#"{"name": "lib", "main": "src/main"}"#).unwrap();
        fs::write(lib.join("src/main.js"), "").unwrap();
        let fx = Fixture::new(&[dir.path().to_path_buf()]);
        let index = fx.registry.get_module(&dir.path().join("index.js"));
        let req = fx.request(None);

        assert_eq!(
            req.resolve_dependency(&index, "./utils").unwrap().path,
            dir.path().join("utils/index.js")
        );
        assert_eq!(
            req.resolve_dependency(&index, "lib").unwrap().path,
            lib.join("src/main.js")
        );
    }

    #[test]
    fn test_haste_module_and_package_subpath() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("app");
        let pkg = dir.path().join("pkg");
        fs::create_dir_all(&app).unwrap();
        fs::create_dir_all(pkg.join("lib")).unwrap();
        fs::write(app.join("index.js"), "").unwrap();
        fs::write(app.join("Bar.js"), "/**\n * @providesModule Bar\n */").unwrap();
        fs::write(pkg.join("package.json"), r#"{"name": "shared"}"#).unwrap();
        fs::write(pkg.join("index.js"), "").unwrap();
        fs::write(pkg.join("lib/util.js"), "").unwrap();
        let fx = Fixture::new(&[app.clone(), pkg.clone()]);
        let index = fx.registry.get_module(&app.join("index.js"));
        let req = fx.request(Some("ios"));

        assert_eq!(req.resolve_dependency(&index, "Bar").unwrap().path, app.join("Bar.js"));
        assert_eq!(req.resolve_dependency(&index, "shared").unwrap().path, pkg.join("index.js"));
        assert_eq!(
            req.resolve_dependency(&index, "shared/lib/util").unwrap().path,
            pkg.join("lib/util.js")
        );
    }

    #[test]
    fn test_browser_false_yields_null_module() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name": "app", "browser": {"./lib/a.js": false, "left-pad": "./lib/pad.js"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        fs::write(dir.path().join("lib/a.js"), "").unwrap();
        fs::write(dir.path().join("lib/pad.js"), "").unwrap();
        let fx = Fixture::new(&[dir.path().to_path_buf()]);
        let index = fx.registry.get_module(&dir.path().join("index.js"));
        let req = fx.request(None);

        let null = req.resolve_dependency(&index, "./lib/a").unwrap();
        assert!(null.is_null());
        assert_eq!(fx.registry.name(&null).unwrap(), "./lib/a");
        assert_eq!(NULL_MODULE_CODE, "module.exports = null;");

        let pad = req.resolve_dependency(&index, "left-pad").unwrap();
        assert_eq!(pad.path, dir.path().join("lib/pad.js"));
    }

    #[test]
    fn test_global_redirect_and_builtins() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        fs::write(dir.path().join("shim.js"), "").unwrap();
        let mut fx = Fixture::new(&[dir.path().to_path_buf()]);
        fx.global.redirect.insert(
            "old".into(),
            RedirectTarget::To(dir.path().join("shim.js").to_string_lossy().into_owned()),
        );
        fx.global
            .redirect
            .insert("gone".into(), RedirectTarget::Suppress(false));
        let index = fx.registry.get_module(&dir.path().join("index.js"));
        let req = fx.request(None);

        assert_eq!(req.resolve_dependency(&index, "old").unwrap().path, dir.path().join("shim.js"));
        assert!(req.resolve_dependency(&index, "gone").unwrap().is_null());
        assert!(req.resolve_dependency(&index, "fs").unwrap().is_null());
    }

    #[test]
    fn test_unresolvable_and_cached() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        fs::write(dir.path().join("a.js"), "").unwrap();
        let fx = Fixture::new(&[dir.path().to_path_buf()]);
        let index = fx.registry.get_module(&dir.path().join("index.js"));
        let req = fx.request(Some("ios"));

        let err = req.resolve_dependency(&index, "./missing").unwrap_err();
        assert!(err.is_unable_to_resolve());

        let first = req.resolve_dependency(&index, "./a").unwrap();
        assert_eq!(fx.registry.resolution_count(), 1);
        let second = req.resolve_dependency(&index, "./a").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(fx.registry.resolution_count(), 1);
    }

    #[test]
    fn test_asset_resolution() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "").unwrap();
        fs::write(dir.path().join("logo@2x.png"), "").unwrap();
        let fx = Fixture::new(&[dir.path().to_path_buf()]);
        let index = fx.registry.get_module(&dir.path().join("index.js"));
        let asset = fx.request(None).resolve_dependency(&index, "./logo.png").unwrap();
        assert!(asset.is_asset());
        assert_eq!(asset.path, dir.path().join("logo@2x.png"));
        assert_eq!(fx.registry.name(&asset).unwrap(), "logo.png");
    }
}
