//! Error types for envsmith-core

use thiserror::Error;

/// Result type alias using envsmith-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for configuration and catalog handling
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {message}")]
    InvalidConfig { message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unresolvable catalog entry
    #[error("Invalid catalog entry '{component}': {message}")]
    InvalidComponent { component: String, message: String },

    /// Several catalog entries failed validation
    #[error("Catalog validation failed:\n{errors}")]
    CatalogValidation { errors: String },
}

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid component error
    pub fn invalid_component(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidComponent {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Collapse a list of per-entry errors into one validation error
    pub fn catalog_validation(errors: &[Error]) -> Self {
        Self::CatalogValidation {
            errors: errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
