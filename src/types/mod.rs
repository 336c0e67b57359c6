//! Core types for the warden.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (BuildId, SessionSecret)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for every component

mod config;
mod errors;
mod ids;

pub use config::{
    Config, EngineConfig, InstallConfig, PathsConfig, PipelineConfig, TransportConfig,
    WatchdogConfig,
};
pub use errors::{Error, Result};
pub use ids::{BuildId, SessionSecret};
