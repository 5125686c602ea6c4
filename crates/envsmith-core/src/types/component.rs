//! Component catalog record types
//!
//! A component is an installable unit with dependencies and an install
//! recipe. Records are deserialized from the catalog and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A single installable component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Unique, filesystem-safe identifier
    pub id: String,

    /// Free-form grouping used for display
    #[serde(default = "default_category")]
    pub category: String,

    /// Desired version; an older detected version yields NeedsUpdate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Ids of components that must be present first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// How the artifact is applied to the system
    pub install_method: InstallMethod,

    /// Where the artifact comes from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,

    /// Predicates that confirm functional presence (combined with OR)
    #[serde(default)]
    pub verify_actions: Vec<VerifyAction>,

    /// Explicit uninstall command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall_hint: Option<UninstallHint>,

    /// Key used for platform package-inventory lookups (defaults to `id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,

    /// Method-specific install parameters
    #[serde(default)]
    pub install: InstallSpec,
}

fn default_category() -> String {
    "general".to_string()
}

impl Component {
    /// Name used for package-inventory lookups
    pub fn inventory_name(&self) -> &str {
        self.package_name.as_deref().unwrap_or(&self.id)
    }

    /// Whether the install method needs a downloaded artifact
    pub fn needs_artifact(&self) -> bool {
        self.install_method.needs_artifact()
    }
}

/// Install method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    /// Extract a tarball or zip into the target directory
    Archive,
    /// Copy a single downloaded binary into place
    Executable,
    /// Hand the artifact to the platform installer (dpkg, rpm, msiexec, installer)
    InstallerPackage,
    /// Run a downloaded script
    Script,
    /// Nothing to run; the operator installs by hand and verification decides
    Manual,
}

impl InstallMethod {
    /// Whether this method consumes a downloaded artifact
    pub fn needs_artifact(&self) -> bool {
        !matches!(self, InstallMethod::Manual)
    }
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallMethod::Archive => "archive",
            InstallMethod::Executable => "executable",
            InstallMethod::InstallerPackage => "installer_package",
            InstallMethod::Script => "script",
            InstallMethod::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

/// Artifact source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Primary URL
    pub url: String,

    /// Alternate URLs tried in order after the primary
    #[serde(default)]
    pub mirrors: Vec<String>,

    /// Expected hex digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Digest algorithm for `checksum`
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl SourceDescriptor {
    /// Primary URL followed by mirrors
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Length of the hex-encoded digest
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// A typed predicate confirming a component's presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifyAction {
    /// A file or directory exists
    PathExists { path: PathBuf },

    /// A command exits successfully
    CommandSucceeds {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// An environment variable is set, optionally to a specific value
    EnvVarSet {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

impl fmt::Display for VerifyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyAction::PathExists { path } => write!(f, "path_exists({})", path.display()),
            VerifyAction::CommandSucceeds { command, args } if args.is_empty() => {
                write!(f, "command_succeeds({})", command)
            }
            VerifyAction::CommandSucceeds { command, args } => {
                write!(f, "command_succeeds({} {})", command, args.join(" "))
            }
            VerifyAction::EnvVarSet { name, .. } => write!(f, "env_var_set({})", name),
        }
    }
}

/// Declared uninstall command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallHint {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Method-specific install parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    /// Destination for archive extraction or executable copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<PathBuf>,

    /// Arguments passed to installer packages and scripts
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables persisted by the install
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
