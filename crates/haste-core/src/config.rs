use crate::error::{Error, Result};
use haste_util::fs::normalize;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default file name of the project-wide config.
pub const GLOBAL_CONFIG_FILE: &str = "haste.json";

/// Server-lifetime options for the packager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackagerOptions {
    /// Directories crawled and watched.
    pub project_roots: Vec<PathBuf>,

    /// Roots whose relative paths are matched against ignored patterns.
    pub internal_roots: Vec<PathBuf>,

    /// Extensions of source files.
    pub project_exts: Vec<String>,

    /// Extensions of asset files.
    pub asset_exts: Vec<String>,

    /// Platforms recognized in `name.<platform>.ext` file names.
    pub platforms: Vec<String>,

    /// Try `name.native.js` after the platform variant.
    pub prefer_native_platform: bool,

    /// Platforms on which an unresolvable require fails the request.
    pub fatal_unresolved_platforms: Vec<String>,

    /// Regular expressions over `/`-separated paths excluded from crawling.
    pub blacklist: Vec<String>,

    /// Extra polyfill files prepended to every bundle.
    pub polyfills: Vec<PathBuf>,

    /// Pattern of mock files, keyed by their basename.
    pub mocks_pattern: Option<String>,

    /// Bumped to invalidate every persisted cache entry.
    pub cache_version: String,

    /// Where the content memo is persisted. `None` keeps it in memory.
    pub cache_dir: Option<PathBuf>,

    /// Ignore any persisted cache on startup.
    pub reset_cache: bool,

    /// Path of the transformer; its mtime is part of the cache key.
    pub transformer_path: Option<PathBuf>,

    /// Per-module transform timeout in milliseconds.
    pub transform_timeout_ms: u64,
}

impl Default for PackagerOptions {
    fn default() -> Self {
        Self {
            project_roots: Vec::new(),
            internal_roots: Vec::new(),
            project_exts: vec!["js".into(), "jsx".into(), "json".into()],
            asset_exts: ["png", "jpg", "jpeg", "gif", "webp", "ttf", "otf"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            platforms: vec!["ios".into(), "android".into(), "web".into()],
            prefer_native_platform: true,
            fatal_unresolved_platforms: vec!["ios".into()],
            blacklist: Vec::new(),
            polyfills: Vec::new(),
            mocks_pattern: None,
            cache_version: "1.0".into(),
            cache_dir: None,
            reset_cache: false,
            transformer_path: None,
            transform_timeout_ms: 301_000,
        }
    }
}

impl PackagerOptions {
    #[must_use]
    pub fn new(project_roots: Vec<PathBuf>) -> Self {
        Self {
            project_roots,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_asset_exts(mut self, exts: Vec<String>) -> Self {
        self.asset_exts = exts;
        self
    }

    #[must_use]
    pub fn with_platforms(mut self, platforms: Vec<String>) -> Self {
        self.platforms = platforms;
        self
    }

    #[must_use]
    pub fn with_prefer_native_platform(mut self, prefer: bool) -> Self {
        self.prefer_native_platform = prefer;
        self
    }

    #[must_use]
    pub fn with_fatal_unresolved_platforms(mut self, platforms: Vec<String>) -> Self {
        self.fatal_unresolved_platforms = platforms;
        self
    }

    #[must_use]
    pub fn with_blacklist(mut self, patterns: Vec<String>) -> Self {
        self.blacklist = patterns;
        self
    }

    #[must_use]
    pub fn with_polyfills(mut self, polyfills: Vec<PathBuf>) -> Self {
        self.polyfills = polyfills;
        self
    }

    #[must_use]
    pub fn with_mocks_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.mocks_pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    #[must_use]
    pub fn with_reset_cache(mut self, reset: bool) -> Self {
        self.reset_cache = reset;
        self
    }

    #[must_use]
    pub fn with_transformer_path(mut self, path: PathBuf) -> Self {
        self.transformer_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_millis(self.transform_timeout_ms)
    }

    /// Source and asset extensions together, as crawled.
    #[must_use]
    pub fn all_exts(&self) -> Vec<String> {
        let mut exts = self.project_exts.clone();
        for ext in &self.asset_exts {
            if !exts.contains(ext) {
                exts.push(ext.clone());
            }
        }
        exts
    }

    #[must_use]
    pub fn is_fatal_unresolved(&self, platform: Option<&str>) -> bool {
        platform.is_some_and(|p| self.fatal_unresolved_platforms.iter().any(|f| f == p))
    }
}

/// Target of a project-wide redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RedirectTarget {
    To(String),
    /// Only `false` is meaningful; it suppresses the dependency.
    Suppress(bool),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGlobalConfig {
    asset_exts: Option<Vec<String>>,
    ignored_patterns: Option<Vec<String>>,
    #[serde(default)]
    redirect: BTreeMap<String, RedirectTarget>,
}

/// Project-wide config loaded from `haste.json`.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub path: Option<PathBuf>,
    pub asset_exts: Option<Vec<String>>,
    pub ignored_patterns: Option<Regex>,
    pub redirect: BTreeMap<String, RedirectTarget>,
}

impl GlobalConfig {
    /// Load a config file.
    ///
    /// # Errors
    /// Returns `ConfigRead`/`ConfigParse` for unreadable or malformed files,
    /// `Pattern` if the ignored patterns do not compile.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawGlobalConfig =
            serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        let ignored_patterns = match raw.ignored_patterns {
            Some(patterns) if !patterns.is_empty() => {
                let pattern = format!("(^|/)({})(/|$)", patterns.join("|"));
                Some(Regex::new(&pattern).map_err(|e| Error::Pattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };

        let dir = path.parent().unwrap_or(Path::new("."));
        let redirect = raw
            .redirect
            .into_iter()
            .map(|(name, target)| {
                let target = match target {
                    RedirectTarget::To(to) if to.starts_with('.') => {
                        RedirectTarget::To(normalize(&dir.join(&to)).to_string_lossy().into_owned())
                    }
                    other => other,
                };
                (name, target)
            })
            .collect();

        debug!(path = %path.display(), "Loaded global config");
        Ok(Self {
            path: Some(path.to_path_buf()),
            asset_exts: raw.asset_exts,
            ignored_patterns,
            redirect,
        })
    }

    /// Load `haste.json` from `dir` if it exists, else an empty config.
    ///
    /// # Errors
    /// Same as [`GlobalConfig::load`] when the file exists.
    pub fn discover(dir: &Path) -> Result<Self> {
        let path = dir.join(GLOBAL_CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Redirect for a required name, if configured.
    #[must_use]
    pub fn redirect_for(&self, name: &str) -> Option<&RedirectTarget> {
        self.redirect.get(name)
    }
}

/// Options for one bundle request. Also the bundle cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleOptions {
    pub entry_file: PathBuf,
    pub platform: Option<String>,
    pub dev: bool,
    /// Carried through to the transformer; minification itself is out of scope.
    pub minify: bool,
    pub run_module: bool,
    pub run_before_main_module: Vec<String>,
    pub unbundle: bool,
    pub inline_source_map: bool,
}

impl BundleOptions {
    #[must_use]
    pub fn new(entry_file: impl Into<PathBuf>) -> Self {
        Self {
            entry_file: entry_file.into(),
            dev: true,
            run_module: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    #[must_use]
    pub fn with_dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    #[must_use]
    pub fn with_run_module(mut self, run: bool) -> Self {
        self.run_module = run;
        self
    }

    #[must_use]
    pub fn with_run_before_main_module(mut self, ids: Vec<String>) -> Self {
        self.run_before_main_module = ids;
        self
    }

    #[must_use]
    pub fn with_unbundle(mut self, unbundle: bool) -> Self {
        self.unbundle = unbundle;
        self
    }

    /// Stable cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let opts = PackagerOptions::new(vec![PathBuf::from("/proj")]);
        assert!(opts.prefer_native_platform);
        assert!(opts.is_fatal_unresolved(Some("ios")));
        assert!(!opts.is_fatal_unresolved(Some("android")));
        assert!(!opts.is_fatal_unresolved(None));
        assert!(opts.all_exts().contains(&"png".to_string()));
    }

    #[test]
    fn test_global_config_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("haste.json");
        fs::write(
            &path,
            r#"{
                "assetExts": ["png"],
                "ignoredPatterns": ["__tests__", "docs"],
                "redirect": {"old": "new", "gone": false, "local": "./shims/local.js"}
            }"#,
        )
        .unwrap();

        let config = GlobalConfig::load(&path).unwrap();
        assert_eq!(config.asset_exts, Some(vec!["png".to_string()]));
        let ignored = config.ignored_patterns.as_ref().unwrap();
        assert!(ignored.is_match("src/__tests__/a.js"));
        assert!(!ignored.is_match("src/tests/a.js"));
        assert_eq!(config.redirect_for("old"), Some(&RedirectTarget::To("new".into())));
        assert_eq!(config.redirect_for("gone"), Some(&RedirectTarget::Suppress(false)));
        assert_eq!(
            config.redirect_for("local"),
            Some(&RedirectTarget::To(
                dir.path().join("shims/local.js").to_string_lossy().into_owned()
            ))
        );
    }

    #[test]
    fn test_global_config_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("haste.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            GlobalConfig::load(&path),
            Err(Error::ConfigParse { .. })
        ));
        let missing = GlobalConfig::discover(&dir.path().join("nowhere")).unwrap();
        assert!(missing.redirect.is_empty());
    }

    #[test]
    fn test_bundle_options_key_is_stable() {
        let a = BundleOptions::new("index.js").with_platform("ios");
        let b = BundleOptions::new("index.js").with_platform("ios");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), a.clone().with_dev(false).cache_key());
    }
}
