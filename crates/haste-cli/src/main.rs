#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::struct_excessive_bools)]

mod commands;
mod logging;

use clap::Parser;
use commands::bundle::BundleArgs;
use commands::deps::DepsArgs;
use commands::ProjectArgs;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "haste")]
#[command(author, version, about = "Module resolver and bundler for haste-style JavaScript projects", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(flatten)]
    project: ProjectArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build a bundle for an entry file
    Bundle(BundleArgs),

    /// List the ordered dependency paths of an entry file
    Deps(DepsArgs),

    /// Watch the project roots and keep the graph up to date
    Watch,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json);

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    match &cli.command {
        Commands::Bundle(args) => commands::bundle::run(&cwd, &cli.project, args, cli.json),
        Commands::Deps(args) => commands::deps::run(&cwd, &cli.project, args, cli.json),
        Commands::Watch => commands::watch::run(&cwd, &cli.project),
    }
}
