use super::{report, ProjectArgs};
use haste_core::BundleOptions;
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};

#[derive(clap::Args, Debug)]
pub struct DepsArgs {
    /// Entry file, relative to a project root
    #[arg(long, value_name = "FILE")]
    pub entry: PathBuf,

    /// Target platform (inferred from the entry name when omitted)
    #[arg(long)]
    pub platform: Option<String>,

    /// Resolve for a development bundle
    #[arg(long)]
    pub dev: bool,
}

/// Print the ordered dependency paths of an entry, one per line (or as a
/// JSON array).
pub fn run(cwd: &Path, project: &ProjectArgs, args: &DepsArgs, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async {
        let packager = project.start(cwd).await?;
        let mut opts = BundleOptions::new(&args.entry).with_dev(args.dev);
        if let Some(platform) = &args.platform {
            opts = opts.with_platform(platform);
        }

        let paths = packager
            .get_ordered_dependency_paths(&opts)
            .await
            .map_err(|e| report(&e, json))?;
        if json {
            println!("{}", serde_json::to_string(&paths).into_diagnostic()?);
        } else {
            for path in &paths {
                println!("{}", path.display());
            }
        }
        Ok(())
    })
}
