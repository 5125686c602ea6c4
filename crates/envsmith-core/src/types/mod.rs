//! Type definitions for components, status and runtime configuration

mod component;
mod runtime_config;
mod status;

pub use component::*;
pub use runtime_config::*;
pub use status::*;
