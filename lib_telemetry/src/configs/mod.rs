//! # Configuration Modules
//!
//! This module holds the configuration model shared by the pipeline stages and
//! the binaries that host them.

/// Pipeline, database, alert and monitoring settings with their defaults.
pub mod config_pipeline;
