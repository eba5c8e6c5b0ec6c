//! Upstream endpoint configuration
//!
//! The browser-flow constants (client id, authorize/redirect URIs) live with
//! whatever admin surface drives the OAuth handshake — out of scope here. This
//! crate only needs the endpoints it actually calls: token refresh, user info,
//! project-id discovery, model listing, and the `v1internal` RPC surface.

/// Token endpoint for refresh-token grant exchanges.
pub const TOKEN_ENDPOINT: &str = "https://cloudcode.googleapis.com/v1/oauth/token";

/// User-info endpoint, used opportunistically to learn an account's email.
pub const USERINFO_ENDPOINT: &str = "https://cloudcode.googleapis.com/v1/userinfo";

/// Project-id discovery endpoint.
pub const PROJECT_ID_ENDPOINT: &str = "https://cloudcode.googleapis.com/v1internal:resolveProjectId";

/// Available-models-with-quota endpoint.
pub const AVAILABLE_MODELS_ENDPOINT: &str = "https://cloudcode.googleapis.com/v1internal:listModels";

/// Base for `v1internal:<method>` RPC calls.
pub const V1INTERNAL_BASE: &str = "https://cloudcode.googleapis.com/v1internal";
