use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Errors that can occur while proxying a request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Failed to read response body from {service}: {detail}")]
    ResponseBodyError { service: String, detail: String },

    #[error("Backend {service} unreachable: {detail}")]
    BackendUnreachable { service: String, detail: String },

    #[error("Backend {service} timed out")]
    BackendTimeout { service: String },

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Transport-level failures are the retry trigger; application responses
    /// of any status never produce these variants.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnreachable { .. }
                | GatewayError::BackendTimeout { .. }
                | GatewayError::ResponseBodyError { .. }
        )
    }
}
