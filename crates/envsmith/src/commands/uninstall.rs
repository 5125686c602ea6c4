//! Uninstall command

use anyhow::Result;
use camino::Utf8Path;
use envsmith_engine::install::UninstallMethod;

use crate::cli::UninstallArgs;
use crate::output;
use crate::session::Session;

pub async fn run(args: UninstallArgs, catalog: Option<&Utf8Path>, quiet: bool) -> Result<()> {
    let session = Session::open(catalog, quiet).await?;
    let result = session
        .orchestrator
        .uninstall(&args.id, &session.cancel)
        .await;
    session.close().await;

    match result {
        Ok(UninstallMethod::CreatedPaths { removed }) => {
            output::success(&format!("Uninstalled {}", args.id));
            output::warning(&format!(
                "No uninstall hint or package manager record; removed {} path(s) envsmith created, other files may remain",
                removed
            ));
            Ok(())
        }
        Ok(method) => {
            output::success(&format!("Uninstalled {} via {}", args.id, method));
            Ok(())
        }
        Err(failure) => {
            output::failure(&failure);
            anyhow::bail!("Failed to uninstall {}", args.id)
        }
    }
}
