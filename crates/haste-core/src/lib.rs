#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

//! Module resolution and bundling engine.
//!
//! The [`Packager`] is the entry point for a server run: it loads a
//! [`DependencyGraph`] over the project roots, answers ordered-dependency
//! queries and builds bundles through the [`Bundler`], and keeps everything
//! current as watcher events arrive.

pub mod bundler;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod packager;
pub mod registry;
pub mod resolver;
pub mod vfs;
pub mod watch;

pub use bundler::{AbortHandle, Bundle, Bundler, IdentityTransformer, Transformer};
pub use cache::Cache;
pub use config::{BundleOptions, GlobalConfig, PackagerOptions};
pub use error::{Error, Result, TransformError};
pub use graph::DependencyGraph;
pub use packager::{Collaborators, Packager};
pub use watch::{ChangeType, FileWatcher, WatchEvent};
