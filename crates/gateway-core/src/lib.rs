//! Account and credential management, plus upstream dispatch, for a
//! multi-account gateway fronting a Cloud Code-shaped backend.
//!
//! Two subsystems compose the crate:
//!
//! - [`AccountManager`] owns the account list, per-account credential state,
//!   refresh/project-id coalescing, and per-group current-index bookkeeping.
//! - [`UpstreamDispatcher`] owns the per-model quota cache, periodic sweep,
//!   request-time account selection, 429 retry/rotation policy, and
//!   cached-error fast-fail.
//!
//! Account lifecycle:
//! 1. `AccountManager::load_accounts` scans the auth directory and admits
//!    every loadable credential record.
//! 2. A background task refreshes any account already past its deadline,
//!    then repairs any account missing a verified project id.
//! 3. `UpstreamDispatcher::start_sweep_loop` waits for the pool to become
//!    non-empty, takes one quota snapshot, then re-sweeps periodically.
//! 4. Each request selects the best non-excluded, non-cooling-down account
//!    for its model, retrying and rotating on 429 per the asymmetric
//!    single-attempt vs multi-attempt policy.
//! 5. A scheduled timer proactively refreshes each account's token ahead of
//!    expiry; concurrent refresh attempts coalesce onto the first one.

pub mod account;
pub mod account_manager;
pub mod config;
pub mod dispatcher;
pub mod duration;
pub mod error;
pub mod iso_time;
pub mod quota;
pub mod rate_limiter;
#[cfg(test)]
mod test_support;
pub mod token_refresher;

pub use account::{AccountSlot, Group, GroupIndices, ProjectIdRepairSummary, ResolvedCredentials};
pub use account_manager::{AccountManager, AccountSummary, AccountSummaryEntry, CurrentIndices};
pub use dispatcher::{CallV1InternalRequest, UpstreamDispatcher};
pub use error::{Error, Result};
pub use quota::{CachedError, QuotaEntry, QuotaStore};
pub use rate_limiter::RateLimiter;
pub use token_refresher::TokenRefresher;
