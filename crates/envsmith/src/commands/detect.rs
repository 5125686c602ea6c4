//! Detect command

use anyhow::Result;
use camino::Utf8Path;
use envsmith_engine::DetectionReport;
use tabled::Tabled;

use crate::cli::DetectArgs;
use crate::output;
use crate::session::Session;

#[derive(Tabled)]
struct DetectionRow {
    component: String,
    state: String,
    version: String,
    confidence: String,
    #[tabled(rename = "detected by")]
    strategy: String,
    location: String,
}

impl From<&DetectionReport> for DetectionRow {
    fn from(report: &DetectionReport) -> Self {
        let winner = report.winner.as_ref();
        Self {
            component: report.component_id.clone(),
            state: output::state_label(report.state),
            version: output::or_dash(report.version()),
            confidence: format!("{:.2}", report.confidence()),
            strategy: output::or_dash(winner.map(|w| w.strategy)),
            location: output::or_dash(
                winner
                    .and_then(|w| w.observed_path.as_ref())
                    .map(|p| p.display()),
            ),
        }
    }
}

pub async fn run(args: DetectArgs, catalog: Option<&Utf8Path>, quiet: bool) -> Result<()> {
    let session = Session::open(catalog, quiet || args.json).await?;
    let result = session
        .orchestrator
        .detect(&args.ids, &session.cancel)
        .await;
    session.close().await;
    let reports = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    output::table(reports.iter().map(DetectionRow::from));
    for report in &reports {
        warn_about_disagreements(report);
    }
    Ok(())
}

/// Surface strategy errors and conflicting versions
fn warn_about_disagreements(report: &DetectionReport) {
    for failure in &report.strategy_errors {
        output::warning(&format!(
            "{}: {} detection failed: {}",
            report.component_id, failure.strategy, failure.message
        ));
    }
    if !report.version_conflicts.is_empty() {
        let seen: Vec<String> = report
            .version_conflicts
            .iter()
            .map(|v| format!("{} ({})", v.version, v.strategy))
            .collect();
        output::warning(&format!(
            "{}: strategies disagree on the version: {}",
            report.component_id,
            seen.join(", ")
        ));
    }
}
