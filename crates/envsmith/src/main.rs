//! envsmith CLI
//!
//! Thin front end over the provisioning engine.

mod cli;
mod commands;
mod output;
mod session;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands, ConfigCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS operations
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let catalog = cli.catalog.as_deref();
    match cli.command {
        Commands::Resolve(args) => commands::resolve::run(args, catalog),
        Commands::Detect(args) => commands::detect::run(args, catalog, cli.quiet).await,
        Commands::Install(args) => commands::install::run(args, catalog, cli.quiet).await,
        Commands::Uninstall(args) => commands::uninstall::run(args, catalog, cli.quiet).await,
        Commands::Status(args) => commands::status::run(args, catalog).await,
        Commands::Log(args) => commands::log::run(args),
        Commands::Config(ConfigCommands::Show(args)) => commands::config::show(args, catalog),
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
