//! # envsmith-core
//!
//! Core library for envsmith providing:
//! - Component catalog types and structural validation
//! - Runtime configuration with hierarchical precedence
//! - Retry execution engine with policy-based configuration

pub mod catalog;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;
pub mod utils;

pub use catalog::Catalog;
pub use config::HierarchicalConfigLoader;
pub use error::{Error, Result};
pub use utils::get_home_dir;
