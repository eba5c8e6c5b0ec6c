//! Error types for account management and upstream dispatch

/// Errors surfaced by `AccountManager` and `UpstreamDispatcher`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential lookup against an empty pool.
    #[error("no accounts available")]
    NoAccounts,

    /// An account index was out of range.
    #[error("invalid account index: {0}")]
    InvalidIndex(usize),

    /// Transport failure during a dispatch attempt: DNS, TLS, timeout,
    /// connection reset, or any other error the call couldn't be completed
    /// with (token refresh and project-id failures surface as `Auth`).
    #[error("network error: {0}")]
    Network(String),

    /// The attempt loop completed without a response, cached error, or
    /// network error to fall back on.
    #[error("attempt loop exhausted")]
    Exhausted,

    #[error("I/O error: {0}")]
    Io(String),

    /// Token exchange, project-id resolution, or credential-file failures.
    #[error(transparent)]
    Auth(#[from] gateway_auth::Error),

    /// A caller joined an in-flight `refreshToken` attempt led by someone
    /// else, and that attempt failed. Carries the leader's error message
    /// rather than the original `gateway_auth::Error`, since the same
    /// outcome is being handed to every joiner and the error itself isn't
    /// `Clone`.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
