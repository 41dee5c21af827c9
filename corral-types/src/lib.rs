//! Core type definitions for corral.
//!
//! This crate defines the identifiers shared by the wire protocol and the
//! broker:
//! - Job identifiers (UUID v7)
//! - Caller origins used for admission control and permissioning

mod ids;

pub use ids::{JobId, Origin};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid origin: {0:?}")]
    InvalidOrigin(String),
}
