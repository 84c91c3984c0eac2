use super::{report, ProjectArgs};
use haste_core::BundleOptions;
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(clap::Args, Debug)]
pub struct BundleArgs {
    /// Entry file, relative to a project root
    #[arg(long, value_name = "FILE")]
    pub entry: PathBuf,

    /// Target platform (inferred from the entry name when omitted)
    #[arg(long)]
    pub platform: Option<String>,

    /// Development bundle
    #[arg(long)]
    pub dev: bool,

    /// Passed through to the transformer
    #[arg(long)]
    pub minify: bool,

    /// Use the unbundle module system
    #[arg(long)]
    pub unbundle: bool,

    /// Module ids to require before the main module (repeatable)
    #[arg(long = "run-before-main", value_name = "ID")]
    pub run_before_main: Vec<String>,

    /// Do not append the main module invocation
    #[arg(long)]
    pub no_run_module: bool,

    /// Append the source map as a data URL
    #[arg(long)]
    pub inline_source_map: bool,

    /// Emit a prepacked bundle (JSON) instead of a script
    #[arg(long)]
    pub prepack: bool,

    /// Write the bundle here instead of stdout
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Write the indexed source map here
    #[arg(long, value_name = "FILE")]
    pub sourcemap_out: Option<PathBuf>,
}

impl BundleArgs {
    fn options(&self) -> BundleOptions {
        let mut opts = BundleOptions::new(&self.entry)
            .with_dev(self.dev)
            .with_unbundle(self.unbundle)
            .with_run_module(!self.no_run_module)
            .with_run_before_main_module(self.run_before_main.clone());
        if let Some(platform) = &self.platform {
            opts = opts.with_platform(platform);
        }
        opts.minify = self.minify;
        opts.inline_source_map = self.inline_source_map;
        opts
    }
}

fn emit(out: Option<&Path>, content: &str) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, content).into_diagnostic(),
        None => {
            print!("{content}");
            Ok(())
        }
    }
}

pub fn run(cwd: &Path, project: &ProjectArgs, args: &BundleArgs, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async {
        let packager = project.start(cwd).await?;
        let opts = args.options();

        if args.prepack {
            let prepack = packager
                .prepack_bundle(&opts)
                .await
                .map_err(|e| report(&e, json))?;
            let content = serde_json::to_string_pretty(&prepack.to_json()).into_diagnostic()?;
            emit(args.out.as_deref(), &content)?;
            info!(modules = prepack.modules().len(), "Wrote prepack bundle");
            return packager.shutdown().into_diagnostic();
        }

        let bundle = packager
            .build_bundle(&opts)
            .await
            .map_err(|e| report(&e, json))?;
        emit(args.out.as_deref(), &bundle.source(opts.inline_source_map))?;
        if let Some(path) = &args.sourcemap_out {
            let map = serde_json::to_string(&bundle.source_map()).into_diagnostic()?;
            std::fs::write(path, map).into_diagnostic()?;
        }
        info!(
            modules = bundle.modules().len(),
            assets = bundle.assets().len(),
            "Wrote bundle"
        );
        packager.shutdown().into_diagnostic()
    })
}
