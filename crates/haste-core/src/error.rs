use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

use crate::vfs::VfsError;

/// Core error type for haste operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A specifier could not be resolved by any strategy.
    #[error("Unable to resolve module `{name}` from `{}`{}", .from.display(), platform_suffix(.platform.as_deref()))]
    UnableToResolve {
        from: PathBuf,
        name: String,
        platform: Option<String>,
    },

    /// Entry file absent from every project root.
    #[error("Cannot find entry file {} in any of the roots: {roots:?}", .path.display())]
    NotFound { path: PathBuf, roots: Vec<PathBuf> },

    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Two haste-named files claim the same (name, platform) slot.
    #[error("Naming collision detected: {} collides with {} (name `{name}`{})", .path.display(), .existing.display(), platform_suffix(.platform.as_deref()))]
    NamingCollision {
        name: String,
        platform: Option<String>,
        path: PathBuf,
        existing: PathBuf,
    },

    #[error("Unrecognized platform: {0}")]
    UnrecognizedPlatform(String),

    #[error("Bundle build was aborted")]
    Aborted,

    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    #[error("Watcher failed: {0}")]
    Watch(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn platform_suffix(platform: Option<&str>) -> String {
    platform.map(|p| format!(" for platform `{p}`")).unwrap_or_default()
}

/// Failure reported by the transformer for a single file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("TransformError: {}{}: {description}", .path.display(), .line.map(|l| format!(":{l}")).unwrap_or_default())]
pub struct TransformError {
    pub path: PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub description: String,
}

impl TransformError {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: None,
            column: None,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// Error data safe to hand to a serving layer for inline display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub description: String,
    pub filename: Option<String>,
    pub line_number: Option<u32>,
}

const GENERIC_DESCRIPTION: &str = "An internal error occurred while building the bundle";

impl Error {
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable kind, matching the error taxonomy.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnableToResolve { .. } => "UnableToResolveError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Transform(_) => "TransformError",
            Self::NamingCollision { .. } => "NamingCollisionError",
            Self::UnrecognizedPlatform(_) => "UnrecognizedPlatformError",
            Self::Aborted => "AbortedError",
            _ => "InternalError",
        }
    }

    #[must_use]
    pub fn is_unable_to_resolve(&self) -> bool {
        matches!(self, Self::UnableToResolve { .. })
    }

    /// Structured, user-facing view of the error.
    ///
    /// Internal failures only expose a generic description; their full detail
    /// goes to the operator log.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::UnableToResolve { from, .. } => ErrorPayload {
                kind: self.kind(),
                description: self.to_string(),
                filename: Some(from.display().to_string()),
                line_number: None,
            },
            Self::NotFound { path, .. } => ErrorPayload {
                kind: self.kind(),
                description: self.to_string(),
                filename: Some(path.display().to_string()),
                line_number: None,
            },
            Self::Transform(e) => ErrorPayload {
                kind: self.kind(),
                description: e.description.clone(),
                filename: Some(e.path.display().to_string()),
                line_number: e.line,
            },
            Self::NamingCollision { path, .. } => ErrorPayload {
                kind: self.kind(),
                description: self.to_string(),
                filename: Some(path.display().to_string()),
                line_number: None,
            },
            Self::UnrecognizedPlatform(_) | Self::Aborted => ErrorPayload {
                kind: self.kind(),
                description: self.to_string(),
                filename: None,
                line_number: None,
            },
            _ => {
                error!(error = %self, "internal error");
                ErrorPayload {
                    kind: self.kind(),
                    description: GENERIC_DESCRIPTION.to_string(),
                    filename: None,
                    line_number: None,
                }
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
