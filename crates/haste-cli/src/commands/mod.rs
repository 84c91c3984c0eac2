pub mod bundle;
pub mod deps;
pub mod watch;

use haste_core::{GlobalConfig, Packager, PackagerOptions};
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};

/// Project options shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project root to crawl and watch (repeatable; defaults to the working directory)
    #[arg(long = "root", value_name = "PATH", global = true)]
    pub roots: Vec<PathBuf>,

    /// Path to haste.json (defaults to the one in the first root, if any)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Persist the content cache in this directory
    #[arg(long, value_name = "PATH", env = "HASTE_CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Ignore any persisted cache
    #[arg(long, global = true)]
    pub reset_cache: bool,

    /// Exclude paths matching this regex (repeatable)
    #[arg(long = "blacklist", value_name = "REGEX", global = true)]
    pub blacklist: Vec<String>,
}

impl ProjectArgs {
    pub fn roots(&self, cwd: &Path) -> Vec<PathBuf> {
        if self.roots.is_empty() {
            return vec![cwd.to_path_buf()];
        }
        self.roots.iter().map(|r| cwd.join(r)).collect()
    }

    /// Load the global config and start a packager over the roots.
    pub async fn start(&self, cwd: &Path) -> Result<Packager> {
        let roots = self.roots(cwd);
        let global = match &self.config {
            Some(path) => GlobalConfig::load(&cwd.join(path)),
            None => GlobalConfig::discover(&roots[0]),
        }
        .into_diagnostic()?;

        let mut opts = PackagerOptions::new(roots)
            .with_blacklist(self.blacklist.clone())
            .with_reset_cache(self.reset_cache);
        if let Some(dir) = &self.cache_dir {
            opts = opts.with_cache_dir(cwd.join(dir));
        }
        Packager::new(opts, global).await.into_diagnostic()
    }
}

/// Turn a build error into a report. With `json` the structured payload
/// is printed to stdout first.
pub fn report(err: &haste_core::Error, json: bool) -> miette::Report {
    let payload = err.to_payload();
    if json {
        match serde_json::to_string(&payload) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("error: failed to serialize error payload: {e}"),
        }
    }
    miette::miette!("{}", payload.description)
}
