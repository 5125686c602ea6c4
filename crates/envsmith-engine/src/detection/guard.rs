//! Paths that belong to envsmith itself
//!
//! An observation of one of these is envsmith's own state or bundled
//! assets, never a user install.

use envsmith_core::config::ResolvedPaths;
use envsmith_core::types::RuntimeConfig;
use envsmith_core::utils::path_is_within;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct SelfGuard {
    roots: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

impl SelfGuard {
    pub fn new(roots: Vec<PathBuf>, files: Vec<PathBuf>) -> Self {
        Self { roots, files }
    }

    /// State, scratch and bundle directories plus the running executable
    ///
    /// The executable's directory is only guarded when it sits inside
    /// envsmith's home. A shared `bin` such as `~/.cargo/bin` holds real
    /// tools.
    pub fn for_paths(config: &RuntimeConfig, paths: &ResolvedPaths) -> Self {
        let mut roots = vec![
            paths.state_dir.clone().into_std_path_buf(),
            paths.scratch_dir.clone().into_std_path_buf(),
        ];
        if let Some(bundle) = &config.paths.bundle_dir {
            roots.push(bundle.clone().into_std_path_buf());
        }

        let mut files = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            let home = paths.state_dir.parent().map(|p| p.as_std_path());
            if let (Some(dir), Some(home)) = (exe.parent(), home) {
                if path_is_within(dir, home) {
                    roots.push(dir.to_path_buf());
                }
            }
            files.push(exe);
        }
        Self::new(roots, files)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn covers(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path_is_within(path, root))
            || self.files.iter().any(|file| same_file(path, file))
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
