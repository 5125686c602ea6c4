//! Status command

use anyhow::Result;
use camino::Utf8Path;
use envsmith_core::types::ComponentStatus;
use tabled::Tabled;

use crate::cli::StatusArgs;
use crate::output;
use crate::session::Session;

#[derive(Tabled)]
struct StatusRow {
    component: String,
    state: String,
    version: String,
    confidence: String,
    #[tabled(rename = "last checked")]
    last_checked: String,
    #[tabled(rename = "last installed")]
    last_installed: String,
    #[tabled(rename = "last error")]
    last_error: String,
}

impl From<&ComponentStatus> for StatusRow {
    fn from(status: &ComponentStatus) -> Self {
        let timestamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
            output::or_dash(t.map(|t| t.format("%Y-%m-%d %H:%M:%S")))
        };
        Self {
            component: status.component_id.clone(),
            state: output::state_label(status.state),
            version: output::or_dash(status.version.as_deref()),
            confidence: format!("{:.2}", status.confidence),
            last_checked: timestamp(status.last_checked),
            last_installed: timestamp(status.last_installed),
            last_error: output::or_dash(status.last_error.as_deref()),
        }
    }
}

/// Show recorded status; no detection runs
pub async fn run(args: StatusArgs, catalog: Option<&Utf8Path>) -> Result<()> {
    let session = Session::open(catalog, true).await?;
    let result = match &args.id {
        Some(id) => session.orchestrator.get_status(id).await.map(|s| vec![s]),
        None => session.orchestrator.all_status().await,
    };
    session.close().await;
    let statuses = result?;

    if args.json {
        match (&args.id, statuses.first()) {
            (Some(_), Some(status)) => println!("{}", serde_json::to_string_pretty(status)?),
            _ => println!("{}", serde_json::to_string_pretty(&statuses)?),
        }
        return Ok(());
    }

    if statuses.is_empty() {
        output::info("Catalog is empty");
        return Ok(());
    }
    output::table(statuses.iter().map(StatusRow::from));
    Ok(())
}
