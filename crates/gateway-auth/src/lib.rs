//! Upstream OAuth credential plumbing
//!
//! Provides the on-disk credential record format, the `HttpClient` contract
//! for the upstream token/user-info/project-id/model/`v1internal` operations,
//! and a `reqwest`-backed implementation of that contract. This crate is a
//! standalone library with no dependency on any serving surface — it can be
//! tested and used independently.
//!
//! Credential flow:
//! 1. `credentials::scan_accounts_dir()` loads every loadable account record
//! 2. `HttpClient::refresh_token()` exchanges a refresh token for a new access token
//! 3. Updated tokens saved via `credentials::write_credentials_atomic()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod http_client;
pub mod reqwest_client;

pub use constants::*;
pub use credentials::Credentials;
pub use error::{Error, Result};
pub use http_client::{
    CallOptions, FetchProjectIdOptions, HttpClient, HttpResponse, ModelQuota, RefreshedTokens,
};
pub use reqwest_client::ReqwestHttpClient;
