//! Per-account deferred refresh scheduling.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::account::AccountSlot;

/// Conservative skew subtracted from `expiry_date` before scheduling a
/// refresh. The upstream source fires at (approximately) the bare expiry
/// with no skew, which is ambiguous and likely buggy under clock jitter —
/// documented open question, resolved here at 60 seconds.
pub const REFRESH_SKEW_MS: u64 = 60_000;

pub(crate) type RefreshFn =
    Arc<dyn Fn(Arc<AccountSlot>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Schedules a single deferred refresh per account. Firing is cancellable
/// and idempotent: `schedule_refresh` always cancels any previous timer for
/// that account before installing a new one, and the spawned task is a
/// plain `tokio::spawn` whose handle is dropped (never awaited) on
/// cancellation, which aborts it.
pub struct TokenRefresher {
    refresh_fn: RefreshFn,
    timers: Mutex<HashMap<String, AbortHandle>>,
}

impl TokenRefresher {
    pub fn new(refresh_fn: RefreshFn) -> Self {
        Self {
            refresh_fn,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }

    /// Cancel any previous timer for this account and install a new one
    /// firing at `expiry_date - REFRESH_SKEW_MS`. Fires immediately if that
    /// deadline has already passed.
    pub async fn schedule_refresh(&self, account: Arc<AccountSlot>) {
        self.cancel_refresh(&account.id).await;

        let expiry_date = account.snapshot().await.expiry_date;
        let now = Self::now_ms();
        let deadline = expiry_date.saturating_sub(REFRESH_SKEW_MS);
        let delay_ms = deadline.saturating_sub(now);

        let refresh_fn = self.refresh_fn.clone();
        let account_for_task = account.clone();
        let handle = tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            debug!(account = %account_for_task.id, "timer fired, refreshing token");
            (refresh_fn)(account_for_task).await;
        });

        let mut timers = self.timers.lock().await;
        timers.insert(account.id.clone(), handle.abort_handle());
    }

    /// Idempotent: cancelling an account with no scheduled timer is a no-op.
    pub async fn cancel_refresh(&self, account_id: &str) {
        let mut timers = self.timers.lock().await;
        if let Some(handle) = timers.remove(account_id) {
            handle.abort();
        }
    }

    /// Kick off (without awaiting) a refresh for every account whose
    /// deadline is already in the past. Returns a handle the caller can
    /// await to know the initial batch has finished.
    pub fn refresh_due_accounts_now(&self, accounts: &[Arc<AccountSlot>]) -> RefreshBatch {
        let refresh_fn = self.refresh_fn.clone();
        let accounts = accounts.to_vec();
        let now = Self::now_ms();

        let mut joins = Vec::new();
        for account in accounts {
            let refresh_fn = refresh_fn.clone();
            joins.push(tokio::spawn(async move {
                let expiry_date = account.snapshot().await.expiry_date;
                if expiry_date.saturating_sub(REFRESH_SKEW_MS) <= now {
                    (refresh_fn)(account).await;
                }
            }));
        }

        RefreshBatch { joins }
    }
}

/// A joined completion handle for `refresh_due_accounts_now`.
pub struct RefreshBatch {
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl RefreshBatch {
    pub async fn wait(self) {
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "refresh task panicked during initial batch");
            }
        }
    }
}
