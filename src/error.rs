//! Error types for the Statehost client

use thiserror::Error;

/// Statehost client error
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential missing, rejected, or refresh failed
    #[error("authorization error: {0}")]
    Authorization(String),

    /// API returned an error response
    #[error("API error {status}: {code}")]
    Api { status: u16, code: String },

    /// Server-reported error on a realtime subscription
    #[error("subscription error {status}: {code}")]
    Subscription { status: u16, code: String },

    /// Realtime transport failure. Disconnects recover automatically and
    /// never surface as this variant; it covers unrecoverable setup problems.
    #[error("transport error: {0}")]
    Transport(String),

    /// Client was constructed with an unusable configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
