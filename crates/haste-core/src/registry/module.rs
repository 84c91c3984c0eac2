use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::platform_extension;

/// Code emitted for a suppressed dependency.
pub const NULL_MODULE_CODE: &str = "module.exports = null;";

/// Index of a live module in the registry arena.
///
/// A rebuilt module gets a fresh id; stale ids simply stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub(crate) u32);

impl ModuleId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a module is backed by.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleKind {
    /// A JavaScript or JSON file on disk.
    Source,
    /// An image or font; never has dependencies.
    Asset {
        resolution: f32,
        name: String,
        asset_type: String,
    },
    /// Synthetic module prepended to every bundle.
    Polyfill {
        id: String,
        dependencies: Vec<String>,
        code: Arc<str>,
    },
    /// Placeholder for a dependency that was deliberately suppressed.
    Null { name: String },
}

/// Data lazily extracted from a source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleData {
    pub haste_id: Option<String>,
    pub dependencies: Vec<String>,
    pub async_dependencies: Vec<Vec<String>>,
}

/// One module. Identity is the normalized absolute path.
#[derive(Debug)]
pub struct Module {
    pub id: ModuleId,
    pub path: PathBuf,
    pub kind: ModuleKind,
    pub(crate) data: OnceLock<ModuleData>,
}

impl Module {
    pub(crate) fn new(id: ModuleId, path: PathBuf, kind: ModuleKind) -> Self {
        Self {
            id,
            path,
            kind,
            data: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        matches!(self.kind, ModuleKind::Source)
            && self.path.extension().is_some_and(|e| e == "json")
    }

    #[must_use]
    pub fn is_asset(&self) -> bool {
        matches!(self.kind, ModuleKind::Asset { .. })
    }

    #[must_use]
    pub fn is_polyfill(&self) -> bool {
        matches!(self.kind, ModuleKind::Polyfill { .. })
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self.kind, ModuleKind::Null { .. })
    }

    /// Whether the module has a file on disk behind it.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, ModuleKind::Null { .. } | ModuleKind::Polyfill { .. })
    }
}

/// Scale and naming information encoded in an asset file name
/// (`icon@2x.ios.png`).
#[derive(Debug, Clone, PartialEq)]
pub struct AssetNameInfo {
    pub resolution: f32,
    pub name: String,
    pub asset_type: String,
    pub platform: Option<String>,
}

impl AssetNameInfo {
    #[must_use]
    pub fn parse(path: &Path, platforms: &[String]) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let asset_type = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let platform = platform_extension(path, platforms);

        let mut stem = file_name
            .strip_suffix(&format!(".{asset_type}"))
            .unwrap_or(&file_name)
            .to_string();
        if let Some(p) = &platform {
            if let Some(s) = stem.strip_suffix(&format!(".{p}")) {
                stem = s.to_string();
            }
        }

        let mut resolution = 1.0;
        if let Some(at) = stem.rfind('@') {
            let scale = &stem[at + 1..];
            if let Some(number) = scale.strip_suffix('x') {
                if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit() || c == '.') {
                    if let Ok(r) = number.parse::<f32>() {
                        resolution = r;
                        stem.truncate(at);
                    }
                }
            }
        }

        Self {
            resolution,
            name: stem,
            asset_type,
            platform,
        }
    }
}
