//! Module registry.
//!
//! Owns one live [`Module`] per normalized path in an arena indexed by
//! [`ModuleId`], the parsed `package.json` handles, and the resolution
//! table mapping `(requester, platform, name)` to a resolved module.
//! Dependers are tracked as a reverse index over that table so a changed
//! file can re-point everything that already resolved to it.

mod docblock;
mod extract;
mod haste_map;
mod module;
mod package;

pub use docblock::Docblock;
pub use extract::{extract_requires, DefaultExtractor, ExtractedDeps, RequireExtractor};
pub use haste_map::{HasteEntry, HasteMap};
pub use module::{AssetNameInfo, Module, ModuleData, ModuleId, ModuleKind, NULL_MODULE_CODE};
pub use package::{Package, Redirect};

use crate::cache::Cache;
use crate::error::Result;
use crate::vfs::{FileChange, Vfs};
use crate::watch::ChangeType;
use haste_util::fs::{normalize, relative_slash};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Key of one cached resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub from: ModuleId,
    pub platform: Option<String>,
    pub name: String,
}

#[derive(Debug, Default)]
struct Arena {
    modules: Vec<Option<Arc<Module>>>,
    by_path: FxHashMap<PathBuf, ModuleId>,
    nulls: FxHashMap<String, ModuleId>,
    resolved: FxHashMap<ResolutionKey, ModuleId>,
    dependers: FxHashMap<ModuleId, FxHashSet<ResolutionKey>>,
}

impl Arena {
    fn insert(&mut self, path: PathBuf, kind: ModuleKind) -> Arc<Module> {
        let id = ModuleId(u32::try_from(self.modules.len()).unwrap_or(u32::MAX));
        let module = Arc::new(Module::new(id, path, kind));
        self.modules.push(Some(module.clone()));
        module
    }

    fn get(&self, id: ModuleId) -> Option<&Arc<Module>> {
        self.modules.get(id.index()).and_then(Option::as_ref)
    }

    fn unlink_outgoing(&mut self, id: ModuleId) {
        let keys: Vec<ResolutionKey> = self
            .resolved
            .keys()
            .filter(|k| k.from == id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(target) = self.resolved.remove(&key) {
                if let Some(set) = self.dependers.get_mut(&target) {
                    set.remove(&key);
                }
            }
        }
    }
}

/// Registry of modules and packages, shared by the haste map, the resolver
/// and the bundler.
#[derive(Debug)]
pub struct ModuleCache {
    vfs: Arc<Vfs>,
    cache: Arc<Cache>,
    extractor: Arc<dyn RequireExtractor>,
    platforms: Vec<String>,
    project_roots: Vec<PathBuf>,
    arena: RwLock<Arena>,
    packages: RwLock<FxHashMap<PathBuf, Arc<Package>>>,
}

impl ModuleCache {
    #[must_use]
    pub fn new(
        vfs: Arc<Vfs>,
        cache: Arc<Cache>,
        extractor: Arc<dyn RequireExtractor>,
        platforms: Vec<String>,
    ) -> Self {
        let project_roots = vfs.roots().to_vec();
        Self {
            vfs,
            cache,
            extractor,
            platforms,
            project_roots,
            arena: RwLock::new(Arena::default()),
            packages: RwLock::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    fn get_or_insert(&self, path: &Path, kind: impl FnOnce(&Path) -> ModuleKind) -> Arc<Module> {
        let path = normalize(path);
        {
            let arena = self.arena.read().unwrap();
            if let Some(module) = arena.by_path.get(&path).and_then(|id| arena.get(*id)) {
                return module.clone();
            }
        }
        let mut arena = self.arena.write().unwrap();
        if let Some(module) = arena.by_path.get(&path).and_then(|id| arena.get(*id)) {
            return module.clone();
        }
        let module = arena.insert(path.clone(), kind(&path));
        arena.by_path.insert(path, module.id);
        module
    }

    /// The live source module for `path`.
    pub fn get_module(&self, path: &Path) -> Arc<Module> {
        self.get_or_insert(path, |_| ModuleKind::Source)
    }

    /// The live asset module for `path`.
    pub fn get_asset_module(&self, path: &Path) -> Arc<Module> {
        let platforms = self.platforms.clone();
        self.get_or_insert(path, move |p| {
            let info = AssetNameInfo::parse(p, &platforms);
            ModuleKind::Asset {
                resolution: info.resolution,
                name: info.name,
                asset_type: info.asset_type,
            }
        })
    }

    /// The null module standing in for the suppressed dependency `name`.
    pub fn get_null_module(&self, name: &str) -> Arc<Module> {
        {
            let arena = self.arena.read().unwrap();
            if let Some(module) = arena.nulls.get(name).and_then(|id| arena.get(*id)) {
                return module.clone();
            }
        }
        let mut arena = self.arena.write().unwrap();
        if let Some(module) = arena.nulls.get(name).and_then(|id| arena.get(*id)) {
            return module.clone();
        }
        let module = arena.insert(
            PathBuf::from(name),
            ModuleKind::Null {
                name: name.to_string(),
            },
        );
        arena.nulls.insert(name.to_string(), module.id);
        module
    }

    /// A polyfill module keyed by `path`. Re-registering an unchanged
    /// polyfill returns the existing instance.
    pub fn create_polyfill(
        &self,
        path: &Path,
        id: &str,
        dependencies: Vec<String>,
        code: Arc<str>,
    ) -> Arc<Module> {
        let path = normalize(path);
        let kind = ModuleKind::Polyfill {
            id: id.to_string(),
            dependencies,
            code,
        };
        let mut arena = self.arena.write().unwrap();
        if let Some(existing) = arena.by_path.get(&path).and_then(|i| arena.get(*i)) {
            if existing.kind == kind {
                return existing.clone();
            }
        }
        let module = arena.insert(path.clone(), kind);
        arena.by_path.insert(path, module.id);
        module
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.arena.read().unwrap().get(id).cloned()
    }

    /// The live module for `path`, if one has been created.
    #[must_use]
    pub fn lookup(&self, path: &Path) -> Option<Arc<Module>> {
        let path = normalize(path);
        let arena = self.arena.read().unwrap();
        arena.by_path.get(&path).and_then(|id| arena.get(*id)).cloned()
    }

    /// The parsed `package.json` at `path`.
    ///
    /// A malformed file is treated as an empty object.
    pub fn get_package(&self, path: &Path) -> Arc<Package> {
        let path = normalize(path);
        let package = {
            let packages = self.packages.read().unwrap();
            packages.get(&path).cloned()
        };
        let package = package.unwrap_or_else(|| {
            self.packages
                .write()
                .unwrap()
                .entry(path.clone())
                .or_insert_with(|| Arc::new(Package::new(path.clone())))
                .clone()
        });
        package.json_or_init(|| match self.vfs.read_file(&package.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %package.path.display(), error = %e, "Malformed package.json");
                Value::Object(serde_json::Map::new())
            }),
            Err(e) => {
                warn!(path = %package.path.display(), error = %e, "Unreadable package.json");
                Value::Object(serde_json::Map::new())
            }
        });
        package
    }

    /// The package governing `module`: nearest `package.json` above it.
    #[must_use]
    pub fn package_for(&self, module: &Module) -> Option<Arc<Package>> {
        if !matches!(module.kind, ModuleKind::Source | ModuleKind::Asset { .. }) {
            return None;
        }
        let pkg_path = self.vfs.closest(&module.path, "package.json")?;
        Some(self.get_package(&pkg_path))
    }

    /// Docblock id and declared dependencies, read once per module instance.
    ///
    /// # Errors
    /// Fails if a source file cannot be read.
    pub fn data(&self, module: &Module) -> Result<ModuleData> {
        if let Some(data) = module.data.get() {
            return Ok(data.clone());
        }
        let data = match &module.kind {
            ModuleKind::Source => self.cache.get(&module.path, "moduleData", || {
                self.read_source(module)
            })?,
            ModuleKind::Polyfill { dependencies, .. } => ModuleData {
                haste_id: None,
                dependencies: dependencies.clone(),
                async_dependencies: Vec::new(),
            },
            ModuleKind::Asset { .. } | ModuleKind::Null { .. } => ModuleData::default(),
        };
        Ok(module.data.get_or_init(|| data).clone())
    }

    fn read_source(&self, module: &Module) -> Result<ModuleData> {
        let content = self.vfs.read_file(&module.path)?;
        let doc = Docblock::parse(&content);
        let haste_id = doc.provides_module();
        if module.is_json() || doc.is_extern() {
            return Ok(ModuleData {
                haste_id,
                ..ModuleData::default()
            });
        }
        let deps = self.extractor.extract(&content);
        Ok(ModuleData {
            haste_id,
            dependencies: deps.sync,
            async_dependencies: deps.async_groups,
        })
    }

    /// Static dependency names in declaration order.
    ///
    /// # Errors
    /// Fails if the module's file cannot be read.
    pub fn dependencies(&self, module: &Module) -> Result<Vec<String>> {
        Ok(self.data(module)?.dependencies)
    }

    /// # Errors
    /// Fails if the module's file cannot be read.
    pub fn async_dependencies(&self, module: &Module) -> Result<Vec<Vec<String>>> {
        Ok(self.data(module)?.async_dependencies)
    }

    /// `node_modules` code only takes part in haste naming when its package
    /// root is itself a watch root.
    fn is_haste_compatible(&self, module: &Module, package: Option<&Package>) -> bool {
        let in_node_modules = module
            .path
            .components()
            .any(|c| c.as_os_str() == "node_modules");
        if !in_node_modules {
            return true;
        }
        package.is_some_and(|p| self.vfs.roots().iter().any(|r| *r == p.root))
    }

    fn is_main(module: &Module, package: &Package) -> bool {
        let main = package.main();
        module.path == main
            || module.path.with_extension("") == main
            || module.path == main.join("index.js")
    }

    /// Whether the module registers a global haste name. Package mains are
    /// reachable through their package entry instead.
    ///
    /// # Errors
    /// Fails if the module's file cannot be read.
    pub fn is_haste(&self, module: &Module) -> Result<bool> {
        if !matches!(module.kind, ModuleKind::Source) {
            return Ok(false);
        }
        let package = self.package_for(module);
        if !self.is_haste_compatible(module, package.as_deref()) {
            return Ok(false);
        }
        Ok(self.data(module)?.haste_id.is_some())
    }

    /// The name a module is registered under in the bundle.
    ///
    /// # Errors
    /// Fails if the module's file cannot be read.
    pub fn name(&self, module: &Module) -> Result<String> {
        match &module.kind {
            ModuleKind::Null { name } => Ok(name.clone()),
            ModuleKind::Polyfill { id, .. } => Ok(id.clone()),
            ModuleKind::Asset {
                name, asset_type, ..
            } => {
                let rel = self.relative_name(&module.path);
                Ok(match rel.rfind('/') {
                    Some(i) => format!("{}/{name}.{asset_type}", &rel[..i]),
                    None => format!("{name}.{asset_type}"),
                })
            }
            ModuleKind::Source => {
                let package = self.package_for(module);
                if self.is_haste_compatible(module, package.as_deref()) {
                    if let Some(id) = self.data(module)?.haste_id {
                        return Ok(id);
                    }
                    if let Some(pkg) = &package {
                        if let Some(name) = pkg.name() {
                            if Self::is_main(module, pkg) {
                                return Ok(name.to_string());
                            }
                        }
                    }
                }
                Ok(self.relative_name(&module.path))
            }
        }
    }

    fn relative_name(&self, path: &Path) -> String {
        self.project_roots
            .iter()
            .find_map(|root| relative_slash(root, path))
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }

    /// Cached resolution for `key`, if its target is still live.
    #[must_use]
    pub fn resolved(&self, key: &ResolutionKey) -> Option<Arc<Module>> {
        let arena = self.arena.read().unwrap();
        arena.resolved.get(key).and_then(|id| arena.get(*id)).cloned()
    }

    pub fn set_resolved(&self, key: ResolutionKey, target: &Module) {
        let mut arena = self.arena.write().unwrap();
        if let Some(previous) = arena.resolved.insert(key.clone(), target.id) {
            if let Some(set) = arena.dependers.get_mut(&previous) {
                set.remove(&key);
            }
        }
        arena.dependers.entry(target.id).or_default().insert(key);
    }

    /// Modules whose cached resolutions point at `module`.
    #[must_use]
    pub fn dependers(&self, module: &Module) -> Vec<Arc<Module>> {
        let arena = self.arena.read().unwrap();
        let mut ids: Vec<ModuleId> = arena
            .dependers
            .get(&module.id)
            .map(|keys| keys.iter().map(|k| k.from).collect())
            .unwrap_or_default();
        ids.sort();
        ids.dedup();
        ids.into_iter().filter_map(|id| arena.get(id).cloned()).collect()
    }

    /// Forget every cached resolution. Modules and their content memos stay.
    pub fn clear_resolutions(&self) {
        let mut arena = self.arena.write().unwrap();
        arena.resolved.clear();
        arena.dependers.clear();
    }

    #[must_use]
    pub fn resolution_count(&self) -> usize {
        self.arena.read().unwrap().resolved.len()
    }

    /// Apply a normalized change to the registry.
    ///
    /// A changed module is rebuilt under a new id and every cached
    /// resolution pointing at it is re-pointed. A deleted module is dropped
    /// with every resolution pointing at it. Adds and deletes also clear the
    /// resolution table, since a new or missing file can change what any
    /// name resolves to. Content caches of unrelated files are kept.
    pub fn process_file_change(&self, change: &FileChange) {
        self.cache.invalidate(&change.path);

        {
            let mut arena = self.arena.write().unwrap();
            let old = arena
                .by_path
                .get(&change.path)
                .and_then(|id| arena.get(*id))
                .cloned();

            if let Some(old) = old {
                arena.by_path.remove(&change.path);
                arena.modules[old.id.index()] = None;
                arena.unlink_outgoing(old.id);
                let dependers = arena.dependers.remove(&old.id).unwrap_or_default();

                if change.kind == ChangeType::Delete {
                    for key in &dependers {
                        arena.resolved.remove(key);
                    }
                } else {
                    let rebuilt = arena.insert(change.path.clone(), old.kind.clone());
                    arena.by_path.insert(change.path.clone(), rebuilt.id);
                    for key in &dependers {
                        arena.resolved.insert(key.clone(), rebuilt.id);
                    }
                    if !dependers.is_empty() {
                        debug!(
                            path = %change.path.display(),
                            count = dependers.len(),
                            "Re-pointed dependers to rebuilt module"
                        );
                    }
                    arena.dependers.insert(rebuilt.id, dependers);
                }
            }

            if matches!(change.kind, ChangeType::Add | ChangeType::Delete) {
                arena.resolved.clear();
                arena.dependers.clear();
            }
        }

        if self.packages.write().unwrap().remove(&change.path).is_some() {
            debug!(path = %change.path.display(), "Dropped package");
        }
    }

    /// Drop every module, package and cached value.
    pub fn refresh(&self) {
        info!("Refreshing the module cache");
        *self.arena.write().unwrap() = Arena::default();
        self.packages.write().unwrap().clear();
        self.cache.clear();
    }

    /// Human-readable listing of every live module with its resolved
    /// dependencies and dependers.
    #[must_use]
    pub fn debug_dump(&self) -> String {
        let arena = self.arena.read().unwrap();
        let mut live: Vec<&Arc<Module>> = arena.modules.iter().flatten().collect();
        live.sort_by(|a, b| a.path.cmp(&b.path));

        let mut out = String::new();
        for module in live {
            let _ = writeln!(out, "{}", module.path.display());
            let mut deps: Vec<(&ResolutionKey, &ModuleId)> = arena
                .resolved
                .iter()
                .filter(|(k, _)| k.from == module.id)
                .collect();
            deps.sort_by(|a, b| a.0.name.cmp(&b.0.name));
            for (key, target) in deps {
                if let Some(target) = arena.get(*target) {
                    let _ = writeln!(out, "  -> {} => {}", key.name, target.path.display());
                }
            }
            if let Some(keys) = arena.dependers.get(&module.id) {
                let mut from: Vec<String> = keys
                    .iter()
                    .filter_map(|k| arena.get(k.from))
                    .map(|m| m.path.display().to_string())
                    .collect();
                from.sort();
                from.dedup();
                for f in from {
                    let _ = writeln!(out, "  <- {f}");
                }
            }
        }
        out
    }
}

/// Platform encoded as the second-to-last extension (`Foo.ios.js`), if it is
/// one of `platforms`.
#[must_use]
pub fn platform_extension(path: &Path, platforms: &[String]) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let mut parts = name.rsplit('.');
    parts.next()?;
    let candidate = parts.next()?;
    parts.next()?;
    platforms
        .iter()
        .find(|p| p.as_str() == candidate)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{crawl, IgnoreRules};
    use std::fs;
    use tempfile::tempdir;

    fn registry(root: &Path) -> ModuleCache {
        let exts: Vec<String> = vec!["js".into(), "json".into(), "png".into()];
        let files = crawl(&[root.to_path_buf()], &exts, &IgnoreRules::default()).unwrap();
        let vfs = Vfs::build(&[root.to_path_buf()], files, IgnoreRules::default(), exts).unwrap();
        ModuleCache::new(
            Arc::new(vfs),
            Arc::new(Cache::in_memory()),
            Arc::new(DefaultExtractor),
            vec!["ios".into(), "android".into()],
        )
    }

    #[test]
    fn test_platform_extension() {
        let platforms = vec!["ios".to_string(), "android".to_string()];
        assert_eq!(
            platform_extension(Path::new("/a/Foo.ios.js"), &platforms).as_deref(),
            Some("ios")
        );
        assert_eq!(platform_extension(Path::new("/a/Foo.js"), &platforms), None);
        assert_eq!(platform_extension(Path::new("/a/ios.js"), &platforms), None);
        assert_eq!(platform_extension(Path::new("/a/Foo.web.js"), &platforms), None);
    }

    #[test]
    fn test_singleton_per_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "").unwrap();
        let reg = registry(dir.path());
        let a = reg.get_module(&dir.path().join("a.js"));
        let b = reg.get_module(&dir.path().join("./a.js"));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_names() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("package.json"), r#"{"name": "app", "main": "main.js"}"#).unwrap();
        fs::write(dir.path().join("main.js"), "").unwrap();
        fs::write(dir.path().join("lib/util.js"), "").unwrap();
        fs::write(dir.path().join("lib/Foo.js"), "/** @providesModule Foo */").unwrap();
        fs::write(dir.path().join("lib/icon@2x.png"), "").unwrap();
        let reg = registry(dir.path());

        let main = reg.get_module(&dir.path().join("main.js"));
        assert_eq!(reg.name(&main).unwrap(), "app");
        assert!(!reg.is_haste(&main).unwrap());

        let util = reg.get_module(&dir.path().join("lib/util.js"));
        assert_eq!(reg.name(&util).unwrap(), "lib/util.js");
        assert!(!reg.is_haste(&util).unwrap());

        let foo = reg.get_module(&dir.path().join("lib/Foo.js"));
        assert_eq!(reg.name(&foo).unwrap(), "Foo");

        let icon = reg.get_asset_module(&dir.path().join("lib/icon@2x.png"));
        assert_eq!(reg.name(&icon).unwrap(), "lib/icon.png");

        let null = reg.get_null_module("fs");
        assert_eq!(reg.name(&null).unwrap(), "fs");
        assert_eq!(reg.get_null_module("fs").id, null.id);
    }

    #[test]
    fn test_change_repoints_dependers() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "require('./b');").unwrap();
        fs::write(dir.path().join("b.js"), "").unwrap();
        let reg = registry(dir.path());

        let a = reg.get_module(&dir.path().join("a.js"));
        let b = reg.get_module(&dir.path().join("b.js"));
        let key = ResolutionKey {
            from: a.id,
            platform: None,
            name: "./b".into(),
        };
        reg.set_resolved(key.clone(), &b);
        assert_eq!(reg.dependers(&b).len(), 1);

        reg.process_file_change(&FileChange {
            kind: ChangeType::Change,
            path: b.path.clone(),
        });
        let rebuilt = reg.resolved(&key).unwrap();
        assert_ne!(rebuilt.id, b.id);
        assert_eq!(rebuilt.path, b.path);
        assert!(reg.get(b.id).is_none());

        reg.process_file_change(&FileChange {
            kind: ChangeType::Delete,
            path: b.path.clone(),
        });
        assert!(reg.resolved(&key).is_none());
    }

    #[test]
    fn test_change_drops_outgoing_resolutions() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "require('./b');").unwrap();
        fs::write(dir.path().join("b.js"), "").unwrap();
        let reg = registry(dir.path());

        let a = reg.get_module(&dir.path().join("a.js"));
        let b = reg.get_module(&dir.path().join("b.js"));
        let key = ResolutionKey {
            from: a.id,
            platform: None,
            name: "./b".into(),
        };
        reg.set_resolved(key.clone(), &b);
        reg.process_file_change(&FileChange {
            kind: ChangeType::Change,
            path: a.path.clone(),
        });
        assert!(reg.resolved(&key).is_none());
        assert!(reg.dependers(&b).is_empty());
        assert!(reg.debug_dump().contains("b.js"));
    }

    #[test]
    fn test_extern_and_json_have_no_dependencies() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("gen.js"), "/** @extern */\nrequire('x');").unwrap();
        fs::write(dir.path().join("data.json"), r#"{"require('x')": 1}"#).unwrap();
        let reg = registry(dir.path());
        let gen = reg.get_module(&dir.path().join("gen.js"));
        let data = reg.get_module(&dir.path().join("data.json"));
        assert!(reg.dependencies(&gen).unwrap().is_empty());
        assert!(reg.dependencies(&data).unwrap().is_empty());
    }
}
