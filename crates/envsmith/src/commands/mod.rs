//! CLI command implementations

pub mod config;
pub mod detect;
pub mod install;
pub mod log;
pub mod resolve;
pub mod status;
pub mod uninstall;

use anyhow::{Context, Result};
use camino::Utf8Path;
use envsmith_core::Catalog;

use crate::session::Settings;

/// Load and validate the catalog without starting the engine
pub(crate) fn load_catalog(settings: &Settings, flag: Option<&Utf8Path>) -> Result<Catalog> {
    let path = settings.catalog_path(flag);
    let catalog = Catalog::load_validated(path.as_std_path())
        .with_context(|| format!("Failed to load catalog {}", path))?;
    tracing::debug!("Loaded {} component(s) from {}", catalog.len(), path);
    Ok(catalog)
}
