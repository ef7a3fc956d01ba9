//! Environment variable loading and management.
//!
//! Host-level settings only; tool implementations read their own variables.

use std::env;
use std::path::Path;

/// Loads environment variables from .env file and system environment.
#[derive(Debug, Clone)]
pub struct EnvironmentLoader {
    env_file: Option<String>,
}

impl EnvironmentLoader {
    /// Initialize the environment loader.
    ///
    /// # Arguments
    /// * `env_file` - Path to .env file. Nothing is loaded unless a path is given.
    pub fn new(env_file: Option<&Path>) -> Self {
        if let Some(env_path) = env_file {
            if env_path.exists() {
                if let Err(e) = dotenv::from_path(env_path) {
                    eprintln!("Warning: Failed to load .env file: {}", e);
                }
            }
        }

        Self {
            env_file: env_file.map(|p| p.to_string_lossy().to_string()),
        }
    }

    /// The .env file this loader was pointed at, if any.
    pub fn env_file(&self) -> Option<&str> {
        self.env_file.as_deref()
    }

    /// API key stored under the given variable name.
    pub fn llm_api_key(&self, var_name: &str) -> Option<String> {
        env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Model override from `STEPFLOW_MODEL`.
    pub fn model_override(&self) -> Option<String> {
        env::var("STEPFLOW_MODEL").ok()
    }

    /// Log level from `STEPFLOW_LOG`, falling back to `RUST_LOG`.
    pub fn log_level(&self) -> Option<String> {
        env::var("STEPFLOW_LOG")
            .or_else(|_| env::var("RUST_LOG"))
            .ok()
    }
}

impl Default for EnvironmentLoader {
    fn default() -> Self {
        Self::new(None)
    }
}
