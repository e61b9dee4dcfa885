//! nydus-commit core - shared types and abstractions.
//!
//! This crate provides the error enum and configuration model used across
//! the nydus-commit runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BaseConfig, Config, DistributionConfig, OssConfig, RuntimeConfig};
pub use error::{CommitError, Result};

/// nydus-commit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
