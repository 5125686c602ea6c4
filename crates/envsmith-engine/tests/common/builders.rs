//! Fluent builder for Component fixtures

#![allow(dead_code)]

use envsmith_core::types::{
    ChecksumAlgorithm, Component, InstallMethod, InstallSpec, SourceDescriptor, UninstallHint,
    VerifyAction,
};
use std::path::{Path, PathBuf};

pub struct ComponentBuilder {
    component: Component,
}

impl ComponentBuilder {
    /// A manual component with no dependencies and no verify actions
    pub fn new(id: &str) -> Self {
        Self {
            component: Component {
                id: id.to_string(),
                category: "general".to_string(),
                version: None,
                dependencies: Vec::new(),
                install_method: InstallMethod::Manual,
                source: None,
                verify_actions: Vec::new(),
                uninstall_hint: None,
                // Keeps inventory lookups from matching anything real
                package_name: Some(format!("envsmith-test-{}", id)),
                install: InstallSpec::default(),
            },
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.component
            .dependencies
            .extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn method(mut self, method: InstallMethod) -> Self {
        self.component.install_method = method;
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.component.version = Some(version.to_string());
        self
    }

    pub fn source(mut self, url: &str, checksum: Option<&str>) -> Self {
        self.component.source = Some(SourceDescriptor {
            url: url.to_string(),
            mirrors: Vec::new(),
            checksum: checksum.map(str::to_string),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
        });
        self
    }

    pub fn mirror(mut self, url: &str) -> Self {
        if let Some(source) = self.component.source.as_mut() {
            source.mirrors.push(url.to_string());
        }
        self
    }

    pub fn verify_path(mut self, path: impl AsRef<Path>) -> Self {
        self.component.verify_actions.push(VerifyAction::PathExists {
            path: path.as_ref().to_path_buf(),
        });
        self
    }

    pub fn verify_command(mut self, command: &str, args: &[&str]) -> Self {
        self.component
            .verify_actions
            .push(VerifyAction::CommandSucceeds {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            });
        self
    }

    pub fn verify_env(mut self, name: &str) -> Self {
        self.component.verify_actions.push(VerifyAction::EnvVarSet {
            name: name.to_string(),
            value: None,
        });
        self
    }

    pub fn target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.component.install.target_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.component
            .install
            .env
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn uninstall_hint(mut self, command: &str, args: &[String]) -> Self {
        self.component.uninstall_hint = Some(UninstallHint {
            command: command.to_string(),
            args: args.to_vec(),
        });
        self
    }

    pub fn build(self) -> Component {
        self.component
    }
}

/// Manual components forming a dependency graph, in declaration order
pub fn graph(edges: &[(&str, &[&str])]) -> Vec<Component> {
    edges
        .iter()
        .map(|(id, deps)| ComponentBuilder::new(id).depends_on(deps).build())
        .collect()
}
