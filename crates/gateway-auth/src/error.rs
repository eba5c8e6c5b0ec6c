//! Error types for upstream credential operations

/// Errors from token refresh, user-info, project-id, and credential-file operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Non-2xx, non-auth-rejection response from the token endpoint.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// 401/403 from the token endpoint — the refresh token itself is invalid.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// `fetchProjectId` exhausted its retry budget without a non-empty id.
    #[error("project id unresolved: {0}")]
    ProjectIdUnresolved(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
