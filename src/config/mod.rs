//! Configuration management for the step orchestrator.
//!
//! This module provides configuration loading through TOML files and
//! environment variable management via `.env` files.
//!
//! # Example
//!
//! ```no_run
//! use stepflow::config::{ConfigurationLoader, EnvironmentLoader};
//! use std::path::Path;
//!
//! let env = EnvironmentLoader::new(None);
//!
//! let config_loader = ConfigurationLoader::new(Some(Path::new("config/stepflow.toml"))).unwrap();
//! let config = &config_loader.config;
//!
//! println!("Max loops: {}", config.orchestrator.max_loops);
//! println!("Model override: {:?}", env.model_override());
//! ```

#[allow(clippy::module_inception)]
pub mod config;
pub mod environment;

// Re-export main types for convenience
pub use self::config::{
    Configuration, ConfigurationLoader, HubConfig, LedgerConfig, LoggingConfig,
    OrchestratorConfig, ProviderConfig,
};
pub use self::environment::EnvironmentLoader;
