//! Resolve command

use anyhow::Result;
use camino::Utf8Path;
use envsmith_engine::resolver::{DependencyResolver, Resolution};

use super::load_catalog;
use crate::cli::ResolveArgs;
use crate::output;
use crate::session::Settings;

/// Print the install order; exits non-zero when anything is unresolvable
pub fn run(args: ResolveArgs, catalog: Option<&Utf8Path>) -> Result<()> {
    let settings = Settings::load()?;
    let catalog = load_catalog(&settings, catalog)?;
    let resolver = DependencyResolver::new(&catalog);
    let resolution = if args.ids.is_empty() {
        resolver.resolve()
    } else {
        resolver.resolve_for(&args.ids)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolution)?);
    } else {
        print_resolution(&resolution);
    }

    if resolution.is_complete() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} component(s) cannot be installed",
            resolution.failures.len()
        )
    }
}

fn print_resolution(resolution: &Resolution) {
    output::header("Install order");
    if resolution.order.is_empty() {
        output::info("Nothing to install");
    }
    for (position, id) in resolution.order.iter().enumerate() {
        println!("  {:>3}. {}", position + 1, id);
    }

    if !resolution.failures.is_empty() {
        output::header("Unresolvable");
        for failure in &resolution.failures {
            output::error(&failure.to_error().to_string());
        }
    }
}
