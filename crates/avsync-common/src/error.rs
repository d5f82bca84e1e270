//! Error types shared across avsync crates

use thiserror::Error;

/// Result type alias for common helpers
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid timestamp '{value}': expected RFC 3339 or YYYY-MM-DDTHH:MM:SS")]
    InvalidTimestamp { value: String },
}
