//! Common test utilities for envsmith-engine
//!
//! - Component builders for catalog fixtures
//! - Temporary state directories and fast runtime configuration
//! - Archive and script helpers for install tests

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod builders;
pub mod fixtures;

pub use builders::*;
pub use fixtures::*;
