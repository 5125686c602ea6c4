//! Log command

use anyhow::{Context, Result};
use console::style;
use envsmith_engine::events::{EngineEvent, EventEnvelope};
use envsmith_engine::EventFilter;

use crate::cli::LogArgs;
use crate::output;
use crate::session::Settings;

const EVENT_TYPES: [&str; 3] = ["status_changed", "failure", "integrity_warning"];

/// Show the tail of the event ledger
pub fn run(args: LogArgs) -> Result<()> {
    let settings = Settings::load()?;
    let ledger = settings.ledger();

    let event_types = args
        .event_type
        .as_deref()
        .map(parse_event_type)
        .transpose()?;
    let filter = EventFilter {
        component_id: args.id.clone(),
        event_types,
        limit: Some(args.limit),
        ..Default::default()
    };
    let events = ledger.query(&filter).context("Failed to read event log")?;

    if events.is_empty() {
        if !args.json {
            output::info("No events found");
        }
        return Ok(());
    }

    for event in &events {
        if args.json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", format_line(event));
        }
    }
    Ok(())
}

fn parse_event_type(value: &str) -> Result<Vec<String>> {
    let normalized = value.trim().to_lowercase().replace('-', "_");
    if EVENT_TYPES.contains(&normalized.as_str()) {
        Ok(vec![normalized])
    } else {
        anyhow::bail!(
            "Unknown event type '{}' (expected one of: {})",
            value,
            EVENT_TYPES.join(", ")
        )
    }
}

fn format_line(envelope: &EventEnvelope) -> String {
    let timestamp = envelope.timestamp.format("%Y-%m-%d %H:%M:%S");
    let summary = match &envelope.event {
        EngineEvent::StatusChanged {
            old_state,
            new_state,
            ..
        } => format!("{} -> {}", old_state, new_state),
        EngineEvent::Failure { kind, message, .. } => {
            format!("{} {}", style(kind).red(), message)
        }
        EngineEvent::IntegrityWarning { url, .. } => {
            format!("{} {}", style("unverified").yellow(), url)
        }
        EngineEvent::Progress { stage, message, .. } => format!("{} {}", stage, message),
    };
    format!(
        "{}  {:<16} {:<18} {}",
        style(timestamp).dim(),
        envelope.event.component_id(),
        envelope.event.type_name(),
        summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsmith_core::types::ComponentState;

    #[test]
    fn test_parse_event_type_normalizes() {
        assert_eq!(parse_event_type("Status-Changed").unwrap(), vec!["status_changed"]);
        assert!(parse_event_type("progress").is_err());
    }

    #[test]
    fn test_format_line_for_transition() {
        console::set_colors_enabled(false);
        let envelope = EventEnvelope::new(
            "session",
            EngineEvent::StatusChanged {
                component_id: "git".into(),
                old_state: ComponentState::NotDetected,
                new_state: ComponentState::Installed,
            },
        );
        let line = format_line(&envelope);
        assert!(line.contains("git"));
        assert!(line.contains("status_changed"));
        assert!(line.ends_with("not detected -> installed"));
    }
}
