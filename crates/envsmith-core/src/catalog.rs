//! Component catalog loading and structural validation
//!
//! The catalog is a YAML (or JSON) document with a top-level `components`
//! list. Declaration order is preserved because the resolver uses it as
//! its tie-break.

use crate::error::{Error, Result};
use crate::types::{Component, InstallMethod, VerifyAction};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

static COMPONENT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("component id regex is valid")
});

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    components: Vec<Component>,
}

/// Immutable, ordered set of components
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    components: Vec<Component>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Build a catalog from records in declaration order
    ///
    /// Later duplicates are kept in the list so `validate` can report them,
    /// but lookups resolve to the first declaration.
    pub fn new(components: Vec<Component>) -> Self {
        let mut index = HashMap::with_capacity(components.len());
        for (i, component) in components.iter().enumerate() {
            index.entry(component.id.clone()).or_insert(i);
        }
        Self { components, index }
    }

    /// Parse a YAML catalog document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_yaml_ng::from_str(content)?;
        Ok(Self::new(doc.components))
    }

    /// Parse a JSON catalog document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_json::from_str(content)?;
        Ok(Self::new(doc.components))
    }

    /// Load a catalog file, choosing the parser from the extension
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::config_not_found(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        tracing::debug!(
            "Loaded {} components from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Load and reject catalogs with structural errors
    pub fn load_validated(path: &Path) -> Result<Self> {
        let catalog = Self::load(path)?;
        let errors = catalog.validate();
        if errors.is_empty() {
            Ok(catalog)
        } else {
            Err(Error::catalog_validation(&errors))
        }
    }

    /// Look up a component by id
    pub fn get(&self, id: &str) -> Option<&Component> {
        self.index.get(id).map(|&i| &self.components[i])
    }

    /// Declaration index of a component
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Whether the catalog declares `id`
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Components in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Check every entry and return all structural problems found
    ///
    /// Dependency references are not checked here; unknown dependencies are
    /// reported per component by the resolver so the rest of the graph can
    /// still resolve.
    pub fn validate(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for component in &self.components {
            let id = &component.id;

            if !seen.insert(id.as_str()) {
                errors.push(Error::invalid_component(id, "duplicate component id"));
            }

            if !COMPONENT_ID_RE.is_match(id) {
                errors.push(Error::invalid_component(
                    id,
                    "id must start with a letter or digit and contain only letters, digits, '.', '_' or '-'",
                ));
            }

            match (&component.source, component.install_method) {
                (None, InstallMethod::Manual) => {}
                (None, method) => errors.push(Error::invalid_component(
                    id,
                    format!("install method '{}' requires a source url", method),
                )),
                (Some(source), _) => {
                    for raw in source.urls() {
                        if let Err(e) = url::Url::parse(raw) {
                            errors.push(Error::invalid_component(
                                id,
                                format!("invalid url '{}': {}", raw, e),
                            ));
                        }
                    }
                    if let Some(checksum) = &source.checksum {
                        let expected_len = source.checksum_algorithm.hex_len();
                        let is_hex = checksum.chars().all(|c| c.is_ascii_hexdigit());
                        if !is_hex || checksum.len() != expected_len {
                            errors.push(Error::invalid_component(
                                id,
                                format!(
                                    "checksum must be {} hex characters for {}",
                                    expected_len, source.checksum_algorithm
                                ),
                            ));
                        }
                    }
                }
            }

            for action in &component.verify_actions {
                if let VerifyAction::CommandSucceeds { command, .. } = action {
                    if command.trim().is_empty() {
                        errors.push(Error::invalid_component(
                            id,
                            "command_succeeds verify action has an empty command",
                        ));
                    }
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    const SAMPLE: &str = r#"
components:
  - id: git
    category: vcs
    install_method: installer_package
    source:
      url: https://example.com/git.deb
    verify_actions:
      - type: command_succeeds
        command: git
        args: ["--version"]
  - id: gh
    dependencies: [git]
    install_method: archive
    source:
      url: https://example.com/gh.tar.gz
      mirrors: ["https://mirror.example.com/gh.tar.gz"]
  - id: docs
    install_method: manual
"#;

    #[test]
    fn test_parse_preserves_declaration_order() {
        let catalog = Catalog::from_yaml_str(SAMPLE).unwrap();
        let ids: Vec<_> = catalog.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["git", "gh", "docs"]);
        assert_eq!(catalog.index_of("gh"), Some(1));
        assert!(catalog.validate().is_empty());
    }

    #[test]
    fn test_load_json_by_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"components":[{"id":"jq","install_method":"manual"}]}"#,
        )
        .unwrap();

        let catalog = Catalog::load(&path).unwrap();
        assert!(catalog.contains("jq"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Catalog::load(Path::new("/nonexistent/catalog.yaml")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_duplicate_ids_reported() {
        let yaml = r#"
components:
  - { id: a, install_method: manual }
  - { id: a, install_method: manual }
"#;
        let catalog = Catalog::from_yaml_str(yaml).unwrap();
        let errors = catalog.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("duplicate"));
    }

    #[test_case("id: ../etc, install_method: manual" ; "path traversal id")]
    #[test_case("id: x, install_method: archive" ; "archive without source")]
    #[test_case("id: x, install_method: script, source: { url: 'not a url' }" ; "bad url")]
    #[test_case("id: x, install_method: script, source: { url: 'https://a/b', checksum: 'abc' }" ; "short checksum")]
    fn test_invalid_entries(entry: &str) {
        let yaml = format!("components:\n  - {{ {} }}\n", entry);
        let catalog = Catalog::from_yaml_str(&yaml).unwrap();
        assert!(!catalog.validate().is_empty(), "expected errors for {entry}");
    }

    #[test]
    fn test_load_validated_rejects_bad_catalog() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("catalog.yaml");
        std::fs::write(&path, "components:\n  - { id: x, install_method: archive }\n").unwrap();

        let err = Catalog::load_validated(&path).unwrap_err();
        assert!(matches!(err, Error::CatalogValidation { .. }));
    }
}
