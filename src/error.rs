//! Error types for the Visor assistant core

use thiserror::Error;

/// Result type alias for Visor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Visor assistant core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Module lifecycle error (instantiation, destruction, supportability)
    #[error("module error: {0}")]
    Module(String),

    /// Unknown module identity
    #[error("module not registered: {0}")]
    ModuleNotFound(String),

    /// Command detection collaborator error
    #[error("detection error: {0}")]
    Detection(String),

    /// Action bus error
    #[error("bus error: {0}")]
    Bus(String),

    /// Watchdog error
    #[error("watchdog error: {0}")]
    Watchdog(String),

    /// Platform collaborator error
    #[error("platform error: {0}")]
    Platform(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
