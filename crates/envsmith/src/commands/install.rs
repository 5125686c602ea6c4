//! Install command

use anyhow::Result;
use camino::Utf8Path;
use envsmith_engine::orchestrator::{ComponentOutcome, InstallOptions, ProvisionResult};
use envsmith_engine::ProvisionReport;
use tabled::Tabled;

use crate::cli::InstallArgs;
use crate::output;
use crate::session::Session;

#[derive(Tabled)]
struct OutcomeRow {
    component: String,
    result: String,
    detail: String,
}

impl From<&ComponentOutcome> for OutcomeRow {
    fn from(outcome: &ComponentOutcome) -> Self {
        let (result, detail) = match &outcome.result {
            ProvisionResult::Installed { version, .. } => (
                console::style("installed").green().to_string(),
                output::or_dash(version.as_deref()),
            ),
            ProvisionResult::AlreadyPresent { state } => {
                (output::state_label(*state), "unchanged".to_string())
            }
            ProvisionResult::Failed { failure } => {
                (console::style("failed").red().to_string(), failure.kind.clone())
            }
            ProvisionResult::Skipped { failure } => {
                (console::style("skipped").yellow().to_string(), failure.kind.clone())
            }
        };
        Self {
            component: outcome.component_id.clone(),
            result,
            detail,
        }
    }
}

/// Provision the given components (or the catalog) in dependency order
pub async fn run(args: InstallArgs, catalog: Option<&Utf8Path>, quiet: bool) -> Result<()> {
    let session = Session::open(catalog, quiet).await?;
    let options = InstallOptions {
        force: args.force,
        ..Default::default()
    };

    if !quiet {
        let what = if args.all {
            "the whole catalog".to_string()
        } else {
            args.ids.join(", ")
        };
        output::info(&format!("Provisioning {}", what));
    }

    // --all resolves the whole catalog through an empty target list
    let targets: &[String] = if args.all { &[] } else { &args.ids };
    let report = session
        .orchestrator
        .provision(targets, &options, &session.cancel)
        .await;
    let cancelled = session.cancel.is_cancelled();
    session.close().await;

    print_report(&report);
    if cancelled {
        anyhow::bail!("Provisioning cancelled");
    }
    if !report.is_success() {
        anyhow::bail!("{} component(s) not installed", report.failures().count());
    }
    output::success("Environment provisioned");
    Ok(())
}

fn print_report(report: &ProvisionReport) {
    if report.outcomes.is_empty() {
        output::info("Nothing to install");
        return;
    }
    output::table(report.outcomes.iter().map(OutcomeRow::from));
    for failure in report.failures() {
        output::failure(failure);
    }
}
