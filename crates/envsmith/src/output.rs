//! Terminal output utilities

use console::style;
use envsmith_core::types::ComponentState;
use envsmith_engine::Failure;
use indicatif::{ProgressBar, ProgressStyle};
use tabled::{settings::Style, Table, Tabled};

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

/// Print a warning message
pub fn warning(msg: &str) {
    eprintln!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a header
pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", style(key).dim(), value);
}

/// Print rows as a rounded table
pub fn table<T: Tabled>(rows: impl IntoIterator<Item = T>) {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
}

/// Print a failure with its remedy and diagnostic trail
pub fn failure(failure: &Failure) {
    let subject = failure.component_id.as_deref().unwrap_or("envsmith");
    error(&format!(
        "{} [{}]: {}",
        style(subject).bold(),
        failure.kind,
        failure.message
    ));
    if let Some(remedy) = &failure.remedy {
        eprintln!("    {} {}", style("hint:").cyan(), remedy);
    }
    for line in &failure.diagnostic_trail {
        eprintln!("    {}", style(line).dim());
    }
}

/// State label colored by health
pub fn state_label(state: ComponentState) -> String {
    let label = state.to_string();
    match state {
        ComponentState::Installed | ComponentState::Detected => style(label).green().to_string(),
        ComponentState::NeedsUpdate => style(label).yellow().to_string(),
        ComponentState::Failed => style(label).red().to_string(),
        ComponentState::NotDetected => style(label).dim().to_string(),
    }
}

/// Create a spinner, hidden when `quiet` or stderr is not a terminal
pub fn spinner(msg: &str, quiet: bool) -> ProgressBar {
    if quiet || !console::Term::stderr().is_term() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// "-" for missing values in tables
pub fn or_dash(value: Option<impl ToString>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
