//! Config show command

use anyhow::Result;
use camino::Utf8Path;

use crate::cli::ConfigShowArgs;
use crate::output;
use crate::session::Settings;

/// Print the merged runtime configuration and resolved directories
pub fn show(args: ConfigShowArgs, catalog: Option<&Utf8Path>) -> Result<()> {
    let settings = Settings::load()?;
    let paths = &settings.paths;
    let catalog_path = settings.catalog_path(catalog);

    if args.json {
        let value = serde_json::json!({
            "config_dir": settings.loader.config_dir(),
            "catalog": catalog_path,
            "paths": {
                "state_dir": paths.state_dir,
                "scratch_dir": paths.scratch_dir,
                "install_root": paths.install_root,
                "ledger": paths.ledger_path(),
            },
            "runtime": settings.config,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    output::header("Paths");
    output::kv("config dir", settings.loader.config_dir().as_str());
    output::kv("catalog", catalog_path.as_str());
    output::kv("state dir", paths.state_dir.as_str());
    output::kv("scratch dir", paths.scratch_dir.as_str());
    output::kv("install root", paths.install_root.as_str());
    output::kv("event log", paths.ledger_path().as_str());

    output::header("Runtime configuration");
    print!("{}", serde_yaml_ng::to_string(&settings.config)?);
    Ok(())
}
