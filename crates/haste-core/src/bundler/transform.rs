//! Transformer contract.

use crate::error::TransformError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Options handed to the transformer for one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    pub platform: Option<String>,
    pub dev: bool,
    pub minify: bool,
}

impl TransformOptions {
    /// Field name under which results are memoized in the content cache.
    #[must_use]
    pub fn cache_field(&self) -> String {
        format!(
            "transformed:{}:{}:{}",
            self.platform.as_deref().unwrap_or("-"),
            u8::from(self.dev),
            u8::from(self.minify)
        )
    }
}

/// Output of a transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transformed {
    pub code: String,
    /// A V3 source map for `code`, if the transformer produced one.
    pub map: Option<Value>,
    pub source_code: String,
    pub source_path: PathBuf,
}

/// Compiles one source file. Implementations may shell out; they are
/// always called off the async runtime.
pub trait Transformer: Send + Sync + Debug {
    /// # Errors
    /// Returns a `TransformError` locating the failure in `path`.
    fn transform(&self, path: &Path, source: &str, opts: &TransformOptions) -> Result<Transformed, TransformError>;
}

/// Returns sources unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn transform(&self, path: &Path, source: &str, _opts: &TransformOptions) -> Result<Transformed, TransformError> {
        Ok(Transformed {
            code: source.to_string(),
            map: None,
            source_code: source.to_string(),
            source_path: path.to_path_buf(),
        })
    }
}
