use super::ProjectArgs;
use haste_core::FileWatcher;
use miette::{IntoDiagnostic, Result};
use std::path::Path;
use tokio::signal;
use tracing::info;

/// Keep the dependency graph live and log invalidations until ctrl+c.
pub fn run(cwd: &Path, project: &ProjectArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async {
        let packager = project.start(cwd).await?;
        let roots = packager.graph().vfs().roots().to_vec();
        let (_watcher, rx) = FileWatcher::start(&roots).into_diagnostic()?;
        eprintln!("Watching {} root(s)... (ctrl+c to exit)", roots.len());

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Watch stopped");
            }
            () = packager.watch(rx) => {
                info!("Watcher closed");
            }
        }
        packager.shutdown().into_diagnostic()
    })
}
