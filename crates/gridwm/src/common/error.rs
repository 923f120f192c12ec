use thiserror::Error;

use crate::common::error::WmError::{NotFoundError, ValidationError};

#[derive(Debug, Error)]
pub enum WmError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFoundError(String),
    #[error("Store error: {0}")]
    TransientStoreError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl WmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, NotFoundError(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ValidationError(_))
    }
}

impl From<serde_json::error::Error> for WmError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<String> for WmError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

pub fn validation<T>(message: String) -> crate::Result<T> {
    Err(ValidationError(message))
}

pub fn not_found<T>(message: String) -> crate::Result<T> {
    Err(NotFoundError(message))
}
