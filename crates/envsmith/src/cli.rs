//! CLI argument parsing with clap

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use envsmith_engine::ledger::DEFAULT_LOG_TAIL_LINES;

/// envsmith - provision a development environment from a component catalog
#[derive(Parser, Debug)]
#[command(name = "envsmith")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the component catalog (default: ~/.envsmith/catalog.yaml)
    #[arg(long, global = true, env = "ENVSMITH_CATALOG")]
    pub catalog: Option<Utf8PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the install order for the catalog
    Resolve(ResolveArgs),

    /// Detect which components are present
    Detect(DetectArgs),

    /// Install components and their dependencies
    Install(InstallArgs),

    /// Uninstall a component
    Uninstall(UninstallArgs),

    /// Show recorded component status
    Status(StatusArgs),

    /// Show the event log
    Log(LogArgs),

    /// Configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Only these components and their dependencies
    pub ids: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Components to detect (default: whole catalog)
    pub ids: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Components to install
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub ids: Vec<String>,

    /// Install the whole catalog
    #[arg(long)]
    pub all: bool,

    /// Reinstall even if already installed
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct UninstallArgs {
    /// Component to uninstall
    pub id: String,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Single component (default: whole catalog)
    pub id: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Only events for this component
    pub id: Option<String>,

    /// Number of most recent events to show
    #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_TAIL_LINES)]
    pub limit: usize,

    /// Filter by event type (status_changed, failure, integrity_warning)
    #[arg(short = 't', long = "type")]
    pub event_type: Option<String>,

    /// Output as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved runtime configuration and paths
    Show(ConfigShowArgs),
}

#[derive(Args, Debug)]
pub struct ConfigShowArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}
