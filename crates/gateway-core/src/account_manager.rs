//! Owns the account list, per-account credential state, refresh/project-id
//! coalescing, and per-group current-index bookkeeping.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use gateway_auth::{Credentials, FetchProjectIdOptions, HttpClient};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::account::{AccountSlot, Group, GroupIndices, InflightRefresh, ProjectIdRepairSummary, ResolvedCredentials};
use crate::error::{Error, Result};
use crate::iso_time::{format_iso8601_ms, now_ms};
use crate::rate_limiter::RateLimiter;
use crate::token_refresher::{RefreshFn, TokenRefresher};

/// Admin-surface summary: `{count, current: {claude, gemini}, accounts: [...]}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSummary {
    pub count: usize,
    pub current: CurrentIndices,
    pub accounts: Vec<AccountSummaryEntry>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CurrentIndices {
    pub claude: usize,
    pub gemini: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSummaryEntry {
    pub id: String,
    pub email: Option<String>,
    pub has_project_id: bool,
    pub refreshing: bool,
}

pub struct AccountManager {
    auth_dir: PathBuf,
    http: Arc<dyn HttpClient>,
    accounts: RwLock<Vec<Arc<AccountSlot>>>,
    indices: RwLock<GroupIndices>,
    refresher: TokenRefresher,
    v1internal_limiter: Arc<RateLimiter>,
}

impl AccountManager {
    pub fn new(auth_dir: PathBuf, http: Arc<dyn HttpClient>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<AccountManager>| {
            let weak_for_closure = weak.clone();
            let refresh_fn: RefreshFn = Arc::new(move |account: Arc<AccountSlot>| {
                let weak = weak_for_closure.clone();
                Box::pin(async move {
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    let observed = account.snapshot().await.expiry_date;
                    if let Err(e) = manager.refresh_token(&account, observed).await {
                        warn!(account = %account.id, error = %e, "scheduled refresh failed");
                    }
                })
            });

            AccountManager {
                auth_dir,
                http,
                accounts: RwLock::new(Vec::new()),
                indices: RwLock::new(GroupIndices::default()),
                refresher: TokenRefresher::new(refresh_fn),
                v1internal_limiter: Arc::new(RateLimiter::default_v1internal()),
            }
        })
    }

    /// Scans the auth directory for JSON records, resets both group indices
    /// to 0, and kicks off (without blocking) initial refresh then
    /// project-id repair across every admitted account.
    pub async fn load_accounts(self: &Arc<Self>) -> Result<AccountSummary> {
        let found = gateway_auth::credentials::scan_accounts_dir(&self.auth_dir)
            .await
            .map_err(Error::Auth)?;

        let slots: Vec<Arc<AccountSlot>> = found
            .into_iter()
            .map(|(id, path, creds)| Arc::new(AccountSlot::new(id, path, creds)))
            .collect();

        info!(count = slots.len(), "loaded accounts");

        {
            let mut accounts = self.accounts.write().await;
            *accounts = slots;
        }
        {
            let mut indices = self.indices.write().await;
            *indices = GroupIndices::default();
        }

        for account in self.accounts.read().await.iter() {
            self.refresher.schedule_refresh(account.clone()).await;
        }

        let manager = self.clone();
        let due = {
            let accounts = self.accounts.read().await;
            self.refresher.refresh_due_accounts_now(&accounts)
        };
        tokio::spawn(async move {
            due.wait().await;
            if let Err(e) = manager.refresh_all_project_ids().await {
                warn!(error = %e, "initial project-id repair failed");
            }
        });

        self.summary().await
    }

    /// Cancels all timers, then reloads from disk.
    pub async fn reload_accounts(self: &Arc<Self>) -> Result<AccountSummary> {
        let ids: Vec<String> = self.accounts.read().await.iter().map(|a| a.id.clone()).collect();
        for id in ids {
            self.refresher.cancel_refresh(&id).await;
        }
        self.load_accounts().await
    }

    pub async fn summary(&self) -> Result<AccountSummary> {
        let accounts = self.accounts.read().await;
        let indices = *self.indices.read().await;
        let mut entries = Vec::with_capacity(accounts.len());
        for account in accounts.iter() {
            let creds = account.snapshot().await;
            entries.push(AccountSummaryEntry {
                id: account.id.clone(),
                email: creds.email.clone(),
                has_project_id: creds.has_verified_project_id(),
                refreshing: account.is_refreshing(),
            });
        }
        Ok(AccountSummary {
            count: accounts.len(),
            current: CurrentIndices {
                claude: indices.claude,
                gemini: indices.gemini,
            },
            accounts: entries,
        })
    }

    async fn account_at(&self, index: usize) -> Result<Arc<AccountSlot>> {
        let accounts = self.accounts.read().await;
        if accounts.is_empty() {
            return Err(Error::NoAccounts);
        }
        accounts.get(index).cloned().ok_or(Error::InvalidIndex(index))
    }

    /// Validates the index; if `expiry_date < now` triggers (and awaits) a
    /// refresh; then ensures a verified `projectId`.
    pub async fn get_credentials_by_index(
        self: &Arc<Self>,
        index: usize,
        _group: Group,
    ) -> Result<ResolvedCredentials> {
        let account = self.account_at(index).await?;

        let snapshot = account.snapshot().await;
        let now = now_ms();
        let snapshot = if snapshot.expiry_date <= now {
            self.refresh_token(&account, snapshot.expiry_date).await?;
            account.snapshot().await
        } else {
            snapshot
        };

        let snapshot = self.ensure_project_id(&account, snapshot).await?;

        Ok(ResolvedCredentials {
            access_token: snapshot.access_token,
            project_id: snapshot.project_id.unwrap_or_default(),
            account_id: account.id.clone(),
            account_index: index,
        })
    }

    pub async fn get_current_access_token(self: &Arc<Self>, group: Group) -> Result<String> {
        Ok(self.get_credentials(group).await?.access_token)
    }

    pub async fn get_credentials(self: &Arc<Self>, group: Group) -> Result<ResolvedCredentials> {
        let index = self.indices.read().await.get(group);
        self.get_credentials_by_index(index, group).await
    }

    /// Like `get_credentials_by_index` but skips project-id resolution;
    /// used by quota sweeps and project-id repair to avoid circularity.
    pub async fn get_access_token_by_index(self: &Arc<Self>, index: usize, _group: Group) -> Result<String> {
        let account = self.account_at(index).await?;
        let snapshot = account.snapshot().await;
        if snapshot.expiry_date <= now_ms() {
            self.refresh_token(&account, snapshot.expiry_date).await?;
            return Ok(account.snapshot().await.access_token);
        }
        Ok(snapshot.access_token)
    }

    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    /// Account ids in index order, as seen by the dispatcher's account
    /// selection and quota sweep.
    pub async fn account_ids(&self) -> Vec<String> {
        self.accounts.read().await.iter().map(|a| a.id.clone()).collect()
    }

    /// Refresh coalescing: every caller racing to refresh the same account
    /// either becomes the leader that performs the single HTTP call, or
    /// joins the leader's in-flight attempt and is handed its exact result —
    /// success or failure — instead of starting an independent attempt of
    /// its own. Only once the leader's attempt has resolved and the slot has
    /// cleared does a newly arriving caller get to lead a fresh one.
    async fn refresh_token(&self, account: &Arc<AccountSlot>, observed_expiry_date: u64) -> Result<()> {
        if account.snapshot().await.expiry_date != observed_expiry_date {
            debug!(account = %account.id, "refresh already completed by a concurrent caller");
            return Ok(());
        }

        let inflight = {
            let mut slot = account.refresh_inflight.lock().await;
            if let Some(inflight) = slot.clone() {
                inflight
            } else {
                let fresh = Arc::new(InflightRefresh::default());
                *slot = Some(fresh.clone());
                return self.lead_refresh(account, fresh).await;
            }
        };

        if let Some(result) = inflight.result.get() {
            return join_refresh_result(result);
        }
        let wait = inflight.done.notified();
        tokio::pin!(wait);
        if let Some(result) = inflight.result.get() {
            return join_refresh_result(result);
        }
        wait.await;
        let result = inflight
            .result
            .get()
            .expect("leader sets a result before notifying waiters");
        join_refresh_result(result)
    }

    /// Runs the actual refresh as the leader of an in-flight attempt,
    /// publishes its outcome to any followers that joined while it ran, then
    /// clears the slot so a later caller starts a fresh attempt.
    async fn lead_refresh(&self, account: &Arc<AccountSlot>, inflight: Arc<InflightRefresh>) -> Result<()> {
        account.refreshing.store(true, Ordering::SeqCst);
        let current = account.snapshot().await;
        let outcome = self.do_refresh(account, current).await;
        account.refreshing.store(false, Ordering::SeqCst);

        let _ = inflight.result.set(outcome.as_ref().map(|_| ()).map_err(ToString::to_string));
        *account.refresh_inflight.lock().await = None;
        inflight.done.notify_waiters();

        if outcome.is_ok() {
            self.refresher.schedule_refresh(account.clone()).await;
        }
        outcome
    }

    async fn do_refresh(&self, account: &Arc<AccountSlot>, current: Credentials) -> Result<()> {
        let refreshed = self
            .http
            .refresh_token(&current.refresh_token)
            .await
            .map_err(Error::Auth)?;

        let mut next = Credentials {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            expiry_date: refreshed.expiry_date,
            token_type: refreshed.token_type.or(current.token_type),
            scope: refreshed.scope.or(current.scope),
            email: current.email,
            project_id: current.project_id.clone(),
            project_id_resolved_at: current.project_id_resolved_at.clone(),
        };

        if !current.has_verified_project_id() {
            let project_id = self
                .http
                .fetch_project_id(&next.access_token, FetchProjectIdOptions { max_attempts: 1 })
                .await
                .map_err(Error::Auth)?;
            next.project_id = Some(project_id);
            next.project_id_resolved_at = Some(format_iso8601_ms(now_ms()));
        }

        gateway_auth::credentials::write_credentials_atomic(&account.path, &next)
            .await
            .map_err(Error::Auth)?;
        account.replace(next).await;

        debug!(account = %account.id, "refreshed token");
        Ok(())
    }

    /// Short-circuits if the credential already has both `projectId` and
    /// `projectIdResolvedAt`. Otherwise installs a single in-flight
    /// resolution whose result is written to disk atomically and cleared.
    async fn ensure_project_id(&self, account: &Arc<AccountSlot>, snapshot: Credentials) -> Result<Credentials> {
        if snapshot.has_verified_project_id() {
            return Ok(snapshot);
        }

        let _gate = account.project_id_gate.lock().await;
        let current = account.snapshot().await;
        if current.has_verified_project_id() {
            return Ok(current);
        }

        let project_id = self
            .http
            .fetch_project_id(&current.access_token, FetchProjectIdOptions { max_attempts: 1 })
            .await
            .map_err(Error::Auth)?;

        let mut next = current;
        next.project_id = Some(project_id);
        next.project_id_resolved_at = Some(format_iso8601_ms(now_ms()));

        gateway_auth::credentials::write_credentials_atomic(&account.path, &next)
            .await
            .map_err(Error::Auth)?;
        account.replace(next.clone()).await;

        Ok(next)
    }

    /// Requires a successfully resolved `projectId` before persisting; an
    /// account without one is refused. Updates an existing slot sharing the
    /// same email, or appends a new one named by sanitized email (fallback
    /// `oauth-<timestamp>.json`). Current indices are preserved; if the
    /// pool was empty they become 0 (already their default).
    pub async fn add_account(self: &Arc<Self>, mut formatted_creds: Credentials) -> Result<String> {
        tokio::fs::create_dir_all(&self.auth_dir)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;

        if !formatted_creds.has_verified_project_id() {
            let project_id = self
                .http
                .fetch_project_id(
                    &formatted_creds.access_token,
                    FetchProjectIdOptions { max_attempts: 1 },
                )
                .await
                .map_err(Error::Auth)?;
            formatted_creds.project_id = Some(project_id);
            formatted_creds.project_id_resolved_at = Some(format_iso8601_ms(now_ms()));
        }

        // Search by email without holding the list lock across awaits: clone
        // the Arc pointers (cheap), then snapshot each slot's credentials.
        let existing = if let Some(email) = formatted_creds.email.clone().filter(|e| !e.is_empty()) {
            let candidates: Vec<Arc<AccountSlot>> = self.accounts.read().await.clone();
            let mut found = None;
            for candidate in candidates {
                if candidate.snapshot().await.email.as_deref() == Some(email.as_str()) {
                    found = Some(candidate);
                    break;
                }
            }
            found
        } else {
            None
        };

        if let Some(existing) = existing {
            gateway_auth::credentials::write_credentials_atomic(&existing.path, &formatted_creds)
                .await
                .map_err(Error::Auth)?;
            existing.replace(formatted_creds).await;
            self.refresher.schedule_refresh(existing.clone()).await;
            return Ok(existing.id.clone());
        }

        let file_name = match formatted_creds.email.as_deref() {
            Some(email) if !email.is_empty() => {
                format!("{}.json", gateway_auth::credentials::sanitize_email_for_filename(email))
            }
            _ => gateway_auth::credentials::fallback_filename(now_ms()),
        };
        let path = self.auth_dir.join(&file_name);
        let id = file_name.trim_end_matches(".json").to_string();

        gateway_auth::credentials::write_credentials_atomic(&path, &formatted_creds)
            .await
            .map_err(Error::Auth)?;

        let slot = Arc::new(AccountSlot::new(id.clone(), path, formatted_creds));
        self.accounts.write().await.push(slot.clone());

        self.refresher.schedule_refresh(slot).await;
        Ok(id)
    }

    /// Sanitizes the name, cancels the account's timer, unlinks the file,
    /// removes it from the list, and adjusts each group's current index.
    pub async fn delete_account_by_file(&self, file_name: &str) -> Result<()> {
        gateway_auth::credentials::validate_deletable_filename(file_name).map_err(Error::Auth)?;
        let id = file_name.trim_end_matches(".json").to_string();

        let mut accounts = self.accounts.write().await;
        let Some(removed_index) = accounts.iter().position(|a| a.id == id) else {
            return Err(Error::InvalidIndex(0));
        };

        self.refresher.cancel_refresh(&id).await;
        let removed = accounts.remove(removed_index);
        let old_len = accounts.len() + 1;

        if let Err(e) = tokio::fs::remove_file(&removed.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::Io(e.to_string()));
            }
        }

        let mut indices = self.indices.write().await;
        indices.adjust_for_removal(removed_index, old_len);

        Ok(())
    }

    /// Thin wrapper around `HttpClient::fetch_available_models` for the
    /// current account, using the shared `v1internal` limiter.
    pub async fn fetch_available_models(
        self: &Arc<Self>,
        group: Group,
    ) -> Result<std::collections::HashMap<String, gateway_auth::ModelQuota>> {
        let token = self.get_current_access_token(group).await?;
        self.v1internal_limiter.wait().await;
        self.http.fetch_available_models(&token).await.map_err(Error::Auth)
    }

    pub async fn fetch_user_info(self: &Arc<Self>, group: Group) -> Result<Option<String>> {
        let token = self.get_current_access_token(group).await?;
        self.v1internal_limiter.wait().await;
        self.http.fetch_user_info(&token).await.map_err(Error::Auth)
    }

    /// Iterates all accounts in parallel; skips already-verified
    /// credentials, otherwise fetches a token by index and resolves the
    /// project id with an aggressive retry budget (`max_attempts=3`, no
    /// shared limiter).
    pub async fn refresh_all_project_ids(self: &Arc<Self>) -> Result<ProjectIdRepairSummary> {
        let count = self.account_count().await;
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let manager = self.clone();
            handles.push(tokio::spawn(async move { manager.repair_project_id_at(i).await }));
        }

        let mut summary = ProjectIdRepairSummary { ok: 0, fail: 0, total: count };
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => summary.ok += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "project-id repair failed for account");
                    summary.fail += 1;
                }
                Err(e) => {
                    warn!(error = %e, "project-id repair task panicked");
                    summary.fail += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn repair_project_id_at(self: Arc<Self>, index: usize) -> Result<()> {
        let account = self.account_at(index).await?;
        if account.snapshot().await.has_verified_project_id() {
            return Ok(());
        }

        // Same gate as `ensure_project_id`: a request-path resolution and a
        // repair sweep racing for the same account must not both fetch.
        let _gate = account.project_id_gate.lock().await;
        if account.snapshot().await.has_verified_project_id() {
            return Ok(());
        }

        let token = self.get_access_token_by_index(index, Group::Gemini).await?;
        let project_id = self
            .http
            .fetch_project_id(&token, FetchProjectIdOptions { max_attempts: 3 })
            .await
            .map_err(Error::Auth)?;

        let mut next = account.snapshot().await;
        next.project_id = Some(project_id);
        next.project_id_resolved_at = Some(format_iso8601_ms(now_ms()));

        gateway_auth::credentials::write_credentials_atomic(&account.path, &next)
            .await
            .map_err(Error::Auth)?;
        account.replace(next).await;
        Ok(())
    }
}

/// Converts a published refresh outcome into the `Result` handed back to a
/// caller that joined rather than led the attempt.
fn join_refresh_result(result: &std::result::Result<(), String>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(message) => Err(Error::RefreshFailed(message.clone())),
    }
}
