use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Immutable field: {0}")]
    ImmutableField(String),
    #[error("CABR gate: {0}")]
    CabrGate(String),
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl MarketError {
    /// Business failures a saga reports as a result instead of a fault.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            MarketError::ValidationError(_) | MarketError::NotFound(_)
        )
    }

    /// Stable snake_case discriminator used in JSON envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::ValidationError(_) => "validation",
            MarketError::NotFound(_) => "not_found",
            MarketError::InvalidStateTransition(_) => "invalid_state_transition",
            MarketError::PermissionDenied(_) => "permission_denied",
            MarketError::ImmutableField(_) => "immutable_field",
            MarketError::CabrGate(_) => "cabr_gate",
            MarketError::RusqliteError(_) => "sqlite",
            MarketError::IoError(_) => "io",
            MarketError::SerdeError(_) => "serde",
            MarketError::ConfigError(_) => "config",
            MarketError::StorageError(_) => "storage",
        }
    }
}
