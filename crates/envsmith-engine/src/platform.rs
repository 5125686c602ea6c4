//! Platform package managers used for inventory lookups and removal

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static WINGET_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s(\d+(?:\.\d+)+)\s").expect("winget version regex is valid")
});

/// Package managers envsmith knows how to query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageManager {
    Dpkg,
    Rpm,
    Brew,
    Winget,
}

impl PackageManager {
    pub const ALL: [PackageManager; 4] = [
        PackageManager::Dpkg,
        PackageManager::Rpm,
        PackageManager::Brew,
        PackageManager::Winget,
    ];

    /// Binary looked up on PATH to decide availability
    pub fn lookup_binary(&self) -> &'static str {
        match self {
            PackageManager::Dpkg => "dpkg-query",
            PackageManager::Rpm => "rpm",
            PackageManager::Brew => "brew",
            PackageManager::Winget => "winget",
        }
    }

    /// Managers present on this machine, in preference order
    pub fn available() -> Vec<PackageManager> {
        Self::ALL
            .into_iter()
            .filter(|pm| which::which(pm.lookup_binary()).is_ok())
            .collect()
    }

    /// Command printing the installed version of `package`
    pub fn query_command(&self, package: &str) -> (String, Vec<String>) {
        let (program, args): (&str, Vec<&str>) = match self {
            PackageManager::Dpkg => ("dpkg-query", vec!["-W", "-f", "${Version}", package]),
            PackageManager::Rpm => ("rpm", vec!["-q", "--qf", "%{VERSION}", package]),
            PackageManager::Brew => ("brew", vec!["list", "--versions", package]),
            PackageManager::Winget => ("winget", vec!["list", "--exact", "--id", package]),
        };
        (
            program.to_string(),
            args.into_iter().map(str::to_string).collect(),
        )
    }

    /// Command removing `package`
    pub fn remove_command(&self, package: &str) -> (String, Vec<String>) {
        let (program, args): (&str, Vec<&str>) = match self {
            PackageManager::Dpkg => ("dpkg", vec!["-r", package]),
            PackageManager::Rpm => ("rpm", vec!["-e", package]),
            PackageManager::Brew => ("brew", vec!["uninstall", package]),
            PackageManager::Winget => (
                "winget",
                vec!["uninstall", "--exact", "--id", package, "--silent"],
            ),
        };
        (
            program.to_string(),
            args.into_iter().map(str::to_string).collect(),
        )
    }

    /// Extract a version from successful query output
    ///
    /// Returns `None` when the output does not describe an installed package.
    pub fn parse_version(&self, package: &str, output: &str) -> Option<String> {
        let output = output.trim();
        match self {
            PackageManager::Dpkg | PackageManager::Rpm => {
                let version = output.lines().next()?.trim();
                if version.is_empty() || version.contains("not installed") {
                    None
                } else {
                    Some(strip_epoch(version).to_string())
                }
            }
            PackageManager::Brew => output
                .lines()
                .find(|line| line.split_whitespace().next() == Some(package))
                .and_then(|line| line.split_whitespace().last())
                .filter(|v| *v != package)
                .map(str::to_string),
            PackageManager::Winget => output
                .lines()
                .find(|line| line.contains(package))
                .and_then(|line| {
                    let padded = format!("{} ", line);
                    WINGET_VERSION_RE
                        .captures(&padded)
                        .map(|caps| caps[1].to_string())
                }),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageManager::Dpkg => "dpkg",
            PackageManager::Rpm => "rpm",
            PackageManager::Brew => "brew",
            PackageManager::Winget => "winget",
        };
        write!(f, "{}", name)
    }
}

/// Debian versions may carry an `epoch:` prefix
fn strip_epoch(version: &str) -> &str {
    match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => version,
    }
}
