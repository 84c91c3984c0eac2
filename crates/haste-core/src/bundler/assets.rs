//! Asset index: finds scale and platform variants of images and fonts.

use crate::registry::AssetNameInfo;
use crate::vfs::Vfs;
use haste_util::fs::normalize;
use haste_util::hash::blake3_files;
use regex_lite::Regex;
use serde::Serialize;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Everything the bundler needs to describe one logical asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetData {
    pub scales: Vec<f32>,
    pub files: Vec<PathBuf>,
    pub hash: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: String,
}

/// Pluggable asset lookup.
pub trait AssetIndex: Send + Sync + Debug {
    /// Called once the virtual filesystem is ready.
    fn build(&self, _vfs: &Vfs) {}

    /// Absolute path of the file backing `name` as required from `from_dir`,
    /// or `None` if no variant exists.
    fn resolve(&self, from_dir: &Path, name: &str, platform: Option<&str>, vfs: &Vfs) -> Option<PathBuf>;

    /// Variants of the asset at `path` for `platform`.
    ///
    /// # Errors
    /// Returns an error if a variant cannot be hashed.
    fn asset_data(&self, path: &Path, platform: Option<&str>, vfs: &Vfs) -> io::Result<AssetData>;
}

/// Default index: variants live next to each other as
/// `name[@<scale>x][.<platform>].<ext>`.
#[derive(Debug, Clone)]
pub struct DefaultAssetIndex {
    exts: Vec<String>,
    platforms: Vec<String>,
}

impl DefaultAssetIndex {
    #[must_use]
    pub fn new(exts: Vec<String>, platforms: Vec<String>) -> Self {
        Self { exts, platforms }
    }

    fn is_asset(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.exts.iter().any(|x| x == e))
    }

    /// Variants of `path` (same directory, name and type), each with its
    /// parsed info, limited to `platform` when it has any, sorted by scale.
    fn variants(&self, path: &Path, platform: Option<&str>, vfs: &Vfs) -> Vec<(PathBuf, AssetNameInfo)> {
        let Some(dir) = path.parent() else {
            return Vec::new();
        };
        let wanted = AssetNameInfo::parse(path, &self.platforms);
        let Ok(pattern) = Regex::new(&format!(
            "/{}(@[0-9.]+x)?(\\.[a-z]+)?\\.{}$",
            escape(&wanted.name),
            escape(&wanted.asset_type)
        )) else {
            return Vec::new();
        };

        let candidates: Vec<(PathBuf, AssetNameInfo)> = vfs
            .matches(dir, &pattern)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| vfs.file_exists(p))
            .map(|p| {
                let info = AssetNameInfo::parse(&p, &self.platforms);
                (p, info)
            })
            .filter(|(_, info)| info.name == wanted.name && info.asset_type == wanted.asset_type)
            .collect();

        let has_platform = platform.is_some_and(|p| {
            candidates
                .iter()
                .any(|(_, info)| info.platform.as_deref() == Some(p))
        });
        let mut selected: Vec<(PathBuf, AssetNameInfo)> = candidates
            .into_iter()
            .filter(|(_, info)| {
                if has_platform {
                    info.platform.as_deref() == platform
                } else {
                    info.platform.is_none()
                }
            })
            .collect();
        selected.sort_by(|a, b| a.1.resolution.total_cmp(&b.1.resolution));
        selected
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl AssetIndex for DefaultAssetIndex {
    fn build(&self, vfs: &Vfs) {
        let start = Instant::now();
        let exts: Vec<&str> = self.exts.iter().map(String::as_str).collect();
        let count = vfs.find_files_by_exts(&exts).len();
        info!(
            assets = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Built asset index"
        );
    }

    fn resolve(&self, from_dir: &Path, name: &str, platform: Option<&str>, vfs: &Vfs) -> Option<PathBuf> {
        if !self.is_asset(name) {
            return None;
        }
        let path = if name.starts_with('/') {
            normalize(Path::new(name))
        } else if name.starts_with('.') {
            normalize(&from_dir.join(name))
        } else {
            return None;
        };
        if vfs.file_exists(&path) && AssetNameInfo::parse(&path, &self.platforms).platform.is_none() {
            if let Some((best, _)) = self.variants(&path, platform, vfs).into_iter().next() {
                return Some(best);
            }
            return Some(path);
        }
        self.variants(&path, platform, vfs)
            .into_iter()
            .next()
            .map(|(p, _)| p)
    }

    fn asset_data(&self, path: &Path, platform: Option<&str>, vfs: &Vfs) -> io::Result<AssetData> {
        let info = AssetNameInfo::parse(path, &self.platforms);
        let mut variants = self.variants(path, platform, vfs);
        if variants.is_empty() {
            variants.push((path.to_path_buf(), info.clone()));
        }
        let files: Vec<PathBuf> = variants.iter().map(|(p, _)| p.clone()).collect();
        let scales = variants.iter().map(|(_, i)| i.resolution).collect();
        let hash = blake3_files(&files)?;
        Ok(AssetData {
            scales,
            files,
            hash,
            name: info.name,
            asset_type: info.asset_type,
        })
    }
}

/// Pixel dimensions of an image file, `None` for fonts and unreadable files.
#[must_use]
pub fn image_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}
