//! HttpClient contract
//!
//! Defines the upstream HTTP operations the rest of the workspace depends on,
//! without committing callers to a concrete transport. Modeled on the same
//! dyn-compatible-trait shape used elsewhere in the workspace for swappable
//! backends: methods return `Pin<Box<dyn Future>>` so the trait stays object
//! safe, letting tests inject an in-memory fake instead of hitting the
//! network.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::Result;

/// Refreshed token material returned by `refresh_token`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// The refresh token to persist going forward. Upstream may rotate it;
    /// when it doesn't, this equals the token that was sent.
    pub refresh_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    /// Absolute expiry, unix milliseconds.
    pub expiry_date: u64,
}

/// A minimal view of an upstream HTTP response. Bodies are buffered as text;
/// nothing in this core needs streaming.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_text: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Per-model quota observation returned by `fetch_available_models`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelQuota {
    pub remaining_fraction: f64,
    pub reset_time: Option<String>,
}

/// Options accepted by `fetch_project_id`.
#[derive(Debug, Clone, Copy)]
pub struct FetchProjectIdOptions {
    pub max_attempts: u32,
}

impl Default for FetchProjectIdOptions {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

/// Options accepted by `call_v1_internal`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub query_string: Option<String>,
    pub headers: HashMap<String, String>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stateless upstream operations. No method here interprets HTTP status
/// codes beyond distinguishing 2xx from non-2xx for its own retry budget —
/// interpreting 429s, rotating accounts, and caching errors is the
/// dispatcher's job (`call_v1_internal` in particular returns the raw
/// response even on non-2xx).
pub trait HttpClient: Send + Sync {
    /// Exchange a refresh token for a new access token. Fails with
    /// `Error::InvalidCredentials` on 4xx from the token endpoint.
    fn refresh_token<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, RefreshedTokens>;

    /// Fetch the account's email, used opportunistically for display.
    fn fetch_user_info<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, Option<String>>;

    /// Resolve the Cloud Code project id backing this account. Retries up to
    /// `options.max_attempts` times on transient failures, with its own
    /// backoff; returns the first non-empty result. Fails with
    /// `Error::ProjectIdUnresolved` if every attempt comes back empty.
    fn fetch_project_id<'a>(
        &'a self,
        access_token: &'a str,
        options: FetchProjectIdOptions,
    ) -> BoxFuture<'a, String>;

    /// Fetch the quota snapshot for every model this account can see.
    fn fetch_available_models<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, HashMap<String, ModelQuota>>;

    /// Invoke `v1internal:<method>`. Returns the raw response including
    /// non-2xx statuses — this method never retries and never interprets
    /// the status code.
    fn call_v1_internal<'a>(
        &'a self,
        method: &'a str,
        access_token: &'a str,
        body: &'a Value,
        options: CallOptions,
    ) -> BoxFuture<'a, HttpResponse>;
}
