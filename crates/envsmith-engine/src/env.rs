//! Session-scoped environment overlay
//!
//! Install steps never mutate the process environment. Variables they set
//! or unset are recorded here, handed to every child process and consulted
//! by `env_var_set` checks. The profile line written alongside remains the
//! durable record.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct EnvOverlay {
    /// `None` masks an inherited variable
    vars: Arc<RwLock<BTreeMap<String, Option<String>>>>,
}

impl EnvOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay value if present, else the inherited environment
    pub fn get(&self, name: &str) -> Option<String> {
        let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());
        match vars.get(name) {
            Some(value) => value.clone(),
            None => std::env::var(name).ok(),
        }
    }

    pub fn set(&self, name: &str, value: &str) {
        self.write(name, Some(value.to_string()));
    }

    pub fn unset(&self, name: &str) {
        self.write(name, None);
    }

    /// Put `name` back to `previous`, unsetting it when there was none
    pub fn restore(&self, name: &str, previous: Option<&str>) {
        match previous {
            Some(value) => self.set(name, value),
            None => self.unset(name),
        }
    }

    /// Apply every overlay entry to a child command
    pub fn apply(&self, cmd: &mut Command) {
        let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());
        for (name, value) in vars.iter() {
            match value {
                Some(value) => {
                    cmd.env(name, value);
                }
                None => {
                    cmd.env_remove(name);
                }
            }
        }
    }

    fn write(&self, name: &str, value: Option<String>) {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.insert(name.to_string(), value);
    }
}
