use thiserror::Error;

/// Main error type for garmin-drive-sync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Garmin session rejected (401). Cached tokens are stale or credentials are wrong.")]
    NotAuthenticated,

    #[error("MFA required. Unattended runs cannot answer an MFA challenge.")]
    MfaRequired,

    #[error("Rate limited. Please wait before retrying.")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid date format: {0}. Expected YYYY-MM-DD")]
    InvalidDateFormat(String),

    #[error("Existing history table is unusable: {0}")]
    InvalidTable(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Create an authentication error from a message
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a configuration error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid response error from a message
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create an invalid table error from a message
    pub fn invalid_table(msg: impl Into<String>) -> Self {
        Self::InvalidTable(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Authentication("Invalid credentials".to_string());
        assert_eq!(err.to_string(), "Authentication error: Invalid credentials");
    }

    #[test]
    fn test_mfa_required_mentions_unattended() {
        let err = SyncError::MfaRequired;
        assert!(err.to_string().contains("Unattended"));
    }

    #[test]
    fn test_invalid_date_format_error() {
        let err = SyncError::InvalidDateFormat("not-a-date".to_string());
        assert!(err.to_string().contains("not-a-date"));
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }

    #[test]
    fn test_timeout_error() {
        let err = SyncError::timeout("download history table", 30);
        assert_eq!(
            err.to_string(),
            "Timed out after 30s: download history table"
        );
    }

    #[test]
    fn test_error_constructors() {
        assert!(matches!(SyncError::auth("x"), SyncError::Authentication(_)));
        assert!(matches!(SyncError::config("x"), SyncError::Config(_)));
        assert!(matches!(
            SyncError::invalid_response("x"),
            SyncError::InvalidResponse(_)
        ));
        assert!(matches!(
            SyncError::invalid_table("x"),
            SyncError::InvalidTable(_)
        ));
    }
}
