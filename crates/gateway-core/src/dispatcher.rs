//! Owns per-model account quota cache, periodic sweep, request-time
//! selection, 429 retry/rotation policy, and cached-error fast-fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_auth::{CallOptions as AuthCallOptions, HttpClient, HttpResponse};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::account::Group;
use crate::account_manager::AccountManager;
use crate::config;
use crate::duration::parse_duration_ms;
use crate::error::{Error, Result};
use crate::iso_time::now_ms;
use crate::quota::QuotaStore;
use crate::rate_limiter::RateLimiter;

/// Inputs to `UpstreamDispatcher::call_v1_internal`.
pub struct CallV1InternalRequest<'a> {
    pub group: Option<Group>,
    pub model: Option<String>,
    pub build_body: Box<dyn Fn(&str) -> Value + Send + Sync + 'a>,
    pub query_string: Option<String>,
    pub headers: HashMap<String, String>,
}

struct Candidate {
    index: usize,
    id: String,
    remaining_percent: Option<u8>,
    reset_time_ms: Option<u64>,
    cooldown_active: bool,
}

pub struct UpstreamDispatcher {
    accounts: Arc<AccountManager>,
    http: Arc<dyn HttpClient>,
    quota: QuotaStore,
    v1internal_limiter: Arc<RateLimiter>,
    sweep_in_progress: AtomicBool,
    initial_sweep_done: AtomicBool,
    initial_sweep_notify: Notify,
}

impl UpstreamDispatcher {
    pub fn new(accounts: Arc<AccountManager>, http: Arc<dyn HttpClient>) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            http,
            quota: QuotaStore::new(),
            v1internal_limiter: Arc::new(RateLimiter::default_v1internal()),
            sweep_in_progress: AtomicBool::new(false),
            initial_sweep_done: AtomicBool::new(false),
            initial_sweep_notify: Notify::new(),
        })
    }

    /// Spawns the self-rescheduling sweep loop: waits for the pool to become
    /// non-empty (bounded by `INITIAL_QUOTA_WAIT_MS`, polling at 50ms), runs
    /// one sweep, signals "initial sweep complete", then re-sweeps every
    /// `QUOTA_REFRESH_S`.
    pub fn start_sweep_loop(self: &Arc<Self>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.wait_for_pool_and_sweep_once().await;
            dispatcher.initial_sweep_done.store(true, Ordering::SeqCst);
            dispatcher.initial_sweep_notify.notify_waiters();

            loop {
                tokio::time::sleep(Duration::from_secs(config::quota_refresh_s())).await;
                dispatcher.sweep().await;
            }
        });
    }

    async fn wait_for_pool_and_sweep_once(self: &Arc<Self>) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(config::initial_quota_wait_ms());
        while self.accounts.account_count().await == 0 {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.sweep().await;
    }

    /// Await the initial sweep, bounded by the same wait window used at
    /// startup — so the first arriving request doesn't race a cold cache.
    async fn await_initial_sweep(&self) {
        if self.initial_sweep_done.load(Ordering::SeqCst) {
            return;
        }
        let wait = self.initial_sweep_notify.notified();
        tokio::pin!(wait);
        if self.initial_sweep_done.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(
            Duration::from_millis(config::initial_quota_wait_ms()),
            wait,
        )
        .await;
    }

    /// Iterates all accounts in parallel, acquiring a token via
    /// `getAccessTokenByIndex` (group irrelevant) and calling
    /// `fetchAvailableModels` without the shared limiter. Non-reentrant: a
    /// concurrent trigger while a sweep is running is dropped.
    async fn sweep(self: &Arc<Self>) {
        if self
            .sweep_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("quota sweep already in progress, dropping this tick");
            return;
        }

        let ids = self.accounts.account_ids().await;
        let mut handles = Vec::with_capacity(ids.len());
        for (index, id) in ids.into_iter().enumerate() {
            let dispatcher = self.clone();
            handles.push(tokio::spawn(async move {
                let token = match dispatcher.accounts.get_access_token_by_index(index, Group::Gemini).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(account = %id, error = %e, "sweep: failed to get access token");
                        return;
                    }
                };
                match dispatcher.http.fetch_available_models(&token).await {
                    Ok(models) => {
                        let now = now_ms();
                        for (model_id, quota) in models {
                            let reset_ms = quota.reset_time.as_deref().and_then(parse_iso8601_ms);
                            dispatcher
                                .quota
                                .record_observation(
                                    &model_id,
                                    &id,
                                    Some(quota.remaining_fraction),
                                    quota.reset_time,
                                    reset_ms,
                                    now,
                                )
                                .await;
                        }
                    }
                    Err(e) => warn!(account = %id, error = %e, "sweep: fetch_available_models failed"),
                }
            }));
        }

        let mut errors = 0;
        for handle in handles {
            if handle.await.is_err() {
                errors += 1;
            }
        }
        if errors > 0 {
            warn!(errors, "quota sweep had account-level failures");
        }
        self.sweep_in_progress.store(false, Ordering::SeqCst);
    }

    /// Build the ranked candidate list for a model.
    async fn candidates(&self, model: &str, excluded: &HashSet<String>, include_zero: bool, now: u64) -> Vec<Candidate> {
        let ids = self.accounts.account_ids().await;
        let mut out = Vec::new();
        for (index, id) in ids.into_iter().enumerate() {
            if excluded.contains(&id) {
                continue;
            }
            let entry = self.quota.get(model, &id).await;
            let remaining_percent = entry.as_ref().and_then(|e| e.remaining_percent());
            if !include_zero && remaining_percent == Some(0) {
                continue;
            }
            let cooldown_active = entry.as_ref().is_some_and(|e| e.is_cooldown_active(now));
            let reset_time_ms = entry.as_ref().and_then(|e| e.reset_time_ms);
            out.push(Candidate {
                index,
                id,
                remaining_percent,
                reset_time_ms,
                cooldown_active,
            });
        }

        out.sort_by(|a, b| {
            a.cooldown_active
                .cmp(&b.cooldown_active)
                .then_with(|| {
                    let ra = a.remaining_percent.map(|p| p as i32).unwrap_or(-1);
                    let rb = b.remaining_percent.map(|p| p as i32).unwrap_or(-1);
                    rb.cmp(&ra)
                })
                .then_with(|| {
                    let ta = a.reset_time_ms.unwrap_or(u64::MAX);
                    let tb = b.reset_time_ms.unwrap_or(u64::MAX);
                    ta.cmp(&tb)
                })
                .then_with(|| a.index.cmp(&b.index))
        });
        out
    }

    /// Pick the single best candidate not yet excluded, falling back to
    /// `includeZero=true` only when every candidate is otherwise excluded
    /// for being known-zero — never for cooldown, which stays excludable
    /// only by rotation.
    async fn select_one(&self, model: &str, excluded: &HashSet<String>, now: u64) -> Option<(usize, String)> {
        let restrictive = self.candidates(model, excluded, false, now).await;
        let chosen = if restrictive.is_empty() {
            self.candidates(model, excluded, true, now).await
        } else {
            restrictive
        };
        let best = chosen.into_iter().find(|c| !c.cooldown_active).or_else(|| {
            // every remaining candidate is cooldown-active; caller treats
            // this as "no viable candidate" and falls back to cached error.
            None
        });
        best.map(|c| (c.index, c.id))
    }

    fn group_for(request_group: Option<Group>, model: Option<&str>) -> Group {
        request_group.unwrap_or_else(|| model.map(Group::infer_from_model).unwrap_or(Group::Gemini))
    }

    fn cached_to_response(cached: &crate::quota::CachedError) -> HttpResponse {
        HttpResponse {
            status: cached.status,
            headers: cached.headers.clone(),
            body_text: cached.body_text.clone(),
        }
    }

    async fn cache_response_as_error(&self, model: &str, resp: &HttpResponse) {
        self.quota
            .cache_error(model, resp.status, resp.headers.clone(), resp.body_text.clone(), now_ms())
            .await;
    }

    /// Parse `retryDelay`/`quotaResetDelay` out of a 429 body's
    /// `error.details[]` array.
    fn parse_retry_ms(body_text: &str) -> Option<u64> {
        let value: Value = serde_json::from_str(body_text).ok()?;
        let details = value.get("error")?.get("details")?.as_array()?;
        for detail in details {
            if let Some(type_field) = detail.get("@type").and_then(Value::as_str) {
                if type_field.contains("RetryInfo") {
                    if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
                        if let Some(ms) = parse_duration_ms(delay) {
                            return Some(ms);
                        }
                    }
                }
            }
            if let Some(delay) = detail
                .get("metadata")
                .and_then(|m| m.get("quotaResetDelay"))
                .and_then(Value::as_str)
            {
                if let Some(ms) = parse_duration_ms(delay) {
                    return Some(ms);
                }
            }
        }
        None
    }

    async fn do_call(
        &self,
        method: &str,
        account_index: usize,
        build_body: &(dyn Fn(&str) -> Value + Send + Sync),
        query_string: Option<String>,
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse> {
        let creds = self.accounts.get_credentials_by_index(account_index, Group::Gemini).await?;
        let body = build_body(&creds.project_id);
        self.v1internal_limiter.wait().await;
        self.http
            .call_v1_internal(method, &creds.access_token, &body, AuthCallOptions { query_string, headers: headers.clone() })
            .await
            .map_err(Error::Auth)
    }

    /// Selects an account, invokes the upstream method, and applies the
    /// 429/network retry-and-rotation policy.
    pub async fn call_v1_internal(self: &Arc<Self>, method: &str, req: CallV1InternalRequest<'_>) -> Result<HttpResponse> {
        let group = Self::group_for(req.group, req.model.as_deref());

        if req.model.is_some() {
            self.await_initial_sweep().await;
        }

        let fixed_retry_delay = config::retry_delay_ms();
        let now = now_ms();

        // Fast-fail gate.
        if let Some(model) = &req.model {
            let ids = self.accounts.account_ids().await;
            if self.quota.all_known_zero(model, &ids).await {
                if let Some(cached) = self.quota.cached_error(model).await {
                    info!(model, "fast-fail: all accounts known-zero, returning cached error");
                    return Ok(Self::cached_to_response(&cached));
                }
                // No cached error yet: perform a single attempt against the
                // best candidate purely to populate one.
                if let Some((index, _id)) = self.select_one(model, &HashSet::new(), now).await {
                    let resp = self
                        .do_call(method, index, req.build_body.as_ref(), req.query_string.clone(), &req.headers)
                        .await?;
                    if !resp.is_success() {
                        self.cache_response_as_error(model, &resp).await;
                    }
                    return Ok(resp);
                }
            }
        }

        let account_count = self.accounts.account_count().await;
        let max_attempts = account_count.max(1);
        let mut tried = HashSet::new();
        let mut last_429: Option<HttpResponse> = None;
        let mut last_network_error: Option<String> = None;
        let model_key = req.model.clone().unwrap_or_default();

        for _attempt in 1..=max_attempts {
            let now = now_ms();
            let model_for_selection = if req.model.is_some() { model_key.as_str() } else { "" };

            let selected = if req.model.is_some() {
                self.select_one(model_for_selection, &tried, now).await
            } else {
                // Model unknown: fall back to the group's current index, no
                // exclusion/cooldown logic.
                let idx = self.accounts.get_credentials(group).await.map(|c| c.account_index).ok();
                idx.map(|i| (i, String::new()))
            };

            let Some((index, account_id)) = selected else {
                break; // every viable candidate is cooldown-active (or pool empty)
            };
            if !account_id.is_empty() {
                tried.insert(account_id.clone());
            }

            let call_result = self
                .do_call(method, index, req.build_body.as_ref(), req.query_string.clone(), &req.headers)
                .await;

            match call_result {
                Ok(resp) if resp.is_success() => return Ok(resp),
                Ok(resp) if resp.status == 429 => {
                    let retry_ms = Self::parse_retry_ms(&resp.body_text);
                    let cooldown_ms = retry_ms.unwrap_or(0).max(fixed_retry_delay);
                    if req.model.is_some() {
                        self.quota.set_cooldown(&model_key, &account_id, now + cooldown_ms, now).await;
                        self.cache_response_as_error(&model_key, &resp).await;
                    }
                    last_429 = Some(resp.clone());

                    if max_attempts == 1 {
                        match retry_ms {
                            Some(ms) if ms > 5000 => return Ok(resp),
                            Some(ms) => {
                                tokio::time::sleep(Duration::from_millis(ms + 200)).await;
                            }
                            None => {
                                tokio::time::sleep(Duration::from_millis(fixed_retry_delay)).await;
                            }
                        }
                        let retried = self
                            .do_call(method, index, req.build_body.as_ref(), req.query_string.clone(), &req.headers)
                            .await?;
                        return Ok(retried);
                    }

                    if retry_ms.is_none() {
                        tokio::time::sleep(Duration::from_millis(fixed_retry_delay)).await;
                    }
                    continue;
                }
                Ok(resp) => {
                    if req.model.is_some() {
                        self.cache_response_as_error(&model_key, &resp).await;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    last_network_error = Some(e.to_string());
                    if max_attempts == 1 {
                        tokio::time::sleep(Duration::from_millis(fixed_retry_delay)).await;
                        return self
                            .do_call(method, index, req.build_body.as_ref(), req.query_string.clone(), &req.headers)
                            .await;
                    }
                    tokio::time::sleep(Duration::from_millis(fixed_retry_delay)).await;
                    continue;
                }
            }
        }

        if let Some(resp) = last_429 {
            return Ok(resp);
        }
        if let Some(err) = last_network_error {
            return Err(Error::Network(err));
        }
        if let Some(model) = &req.model {
            if let Some(cached) = self.quota.cached_error(model).await {
                return Ok(Self::cached_to_response(&cached));
            }
        }
        Err(Error::Exhausted)
    }

    /// Thin convenience that routes through `callV1Internal("countTokens", …)`.
    pub async fn count_tokens(
        self: &Arc<Self>,
        body: Value,
        group: Option<Group>,
        model: Option<String>,
    ) -> Result<HttpResponse> {
        self.call_v1_internal(
            "countTokens",
            CallV1InternalRequest {
                group,
                model,
                build_body: Box::new(move |_project_id| body.clone()),
                query_string: None,
                headers: HashMap::new(),
            },
        )
        .await
    }

    /// Current-account pass-through for the admin UI — distinct from the
    /// sweep's all-accounts variant.
    pub async fn fetch_available_models(self: &Arc<Self>, group: Group) -> Result<HashMap<String, gateway_auth::ModelQuota>> {
        self.accounts.fetch_available_models(group).await
    }
}

/// Best-effort ISO-8601 → epoch-ms parse for `resetTime`. Missing or
/// malformed values degrade to "unknown" rather than an error.
fn parse_iso8601_ms(s: &str) -> Option<u64> {
    // Minimal `YYYY-MM-DDTHH:MM:SS[.fff]Z` parser; anything else is unknown.
    let s = s.strip_suffix('Z')?;
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.splitn(3, '-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: u32 = date_parts.next()?.parse().ok()?;
    let day: u32 = date_parts.next()?.parse().ok()?;

    let (time_main, millis) = match time.split_once('.') {
        Some((main, frac)) => (main, frac.chars().take(3).collect::<String>().parse().unwrap_or(0)),
        None => (time, 0u64),
    };
    let mut time_parts = time_main.splitn(3, ':');
    let hour: u64 = time_parts.next()?.parse().ok()?;
    let minute: u64 = time_parts.next()?.parse().ok()?;
    let second: u64 = time_parts.next()?.parse().ok()?;

    let days = days_from_civil(year, month, day)?;
    let total_ms = (days as i64 * 86_400_000) + (hour as i64 * 3_600_000) + (minute as i64 * 60_000) + (second as i64 * 1000) + millis as i64;
    u64::try_from(total_ms).ok()
}

/// Inverse of `iso_time::civil_from_days`: (year, month, day) to
/// days-since-epoch. See <http://howardhinnant.github.io/date_algorithms.html>.
fn days_from_civil(y: i64, m: u32, d: u32) -> Option<i64> {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = ((m as i64 + 9) % 12) as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146_097 + doe as i64 - 719_468)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_retry_ms_from_retry_info_detail() {
        let body = r#"{"error":{"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"2.5s"}]}}"#;
        assert_eq!(UpstreamDispatcher::parse_retry_ms(body), Some(2500));
    }

    #[test]
    fn parse_retry_ms_from_quota_reset_delay_metadata() {
        let body = r#"{"error":{"details":[{"metadata":{"quotaResetDelay":"1h"}}]}}"#;
        assert_eq!(UpstreamDispatcher::parse_retry_ms(body), Some(3_600_000));
    }

    #[test]
    fn parse_retry_ms_missing_details_is_none() {
        assert_eq!(UpstreamDispatcher::parse_retry_ms(r#"{"error":{}}"#), None);
        assert_eq!(UpstreamDispatcher::parse_retry_ms("not json"), None);
    }

    #[test]
    fn parse_iso8601_roundtrips_against_civil_from_days() {
        let ms = parse_iso8601_ms("2024-06-15T12:34:56.789Z").unwrap();
        assert_eq!(crate::iso_time::format_iso8601_ms(ms), "2024-06-15T12:34:56.789Z");
    }

    mod end_to_end {
        use super::*;
        use crate::account_manager::AccountManager;
        use crate::test_support::{ok_response, retry_info_429, ScriptedHttpClient};
        use gateway_auth::Credentials;
        use serde_json::json;

        fn verified_creds(n: u32) -> Credentials {
            Credentials {
                access_token: format!("token-{n}"),
                refresh_token: format!("refresh-{n}"),
                expiry_date: now_ms() + 3_600_000,
                token_type: Some("Bearer".into()),
                scope: None,
                email: Some(format!("user{n}@example.com")),
                project_id: Some(format!("project-{n}")),
                project_id_resolved_at: Some("2024-01-01T00:00:00.000Z".into()),
            }
        }

        async fn manager_with_accounts(n: u32, http: Arc<dyn HttpClient>) -> Arc<AccountManager> {
            let dir = tempfile::tempdir().unwrap();
            for i in 0..n {
                let path = dir.path().join(format!("user{i}-example-com.json"));
                gateway_auth::credentials::write_credentials_atomic(&path, &verified_creds(i))
                    .await
                    .unwrap();
            }
            let manager = AccountManager::new(dir.path().to_path_buf(), http);
            manager.load_accounts().await.unwrap();
            // keep the tempdir alive for the manager's lifetime by leaking it;
            // these are short-lived test processes.
            std::mem::forget(dir);
            manager
        }

        fn request<'a>(model: &str) -> CallV1InternalRequest<'a> {
            CallV1InternalRequest {
                group: None,
                model: Some(model.to_string()),
                build_body: Box::new(|_project_id| json!({"hello": "world"})),
                query_string: None,
                headers: HashMap::new(),
            }
        }

        /// Scenario: a single healthy account answers on the first try.
        #[tokio::test(start_paused = true)]
        async fn happy_path_returns_first_success() {
            let http = Arc::new(ScriptedHttpClient::new());
            http.push_call(Ok(ok_response(200, r#"{"ok":true}"#)));
            let manager = manager_with_accounts(1, http.clone()).await;

            let dispatcher = UpstreamDispatcher::new(manager, http.clone());
            dispatcher.initial_sweep_done.store(true, Ordering::SeqCst);

            let resp = dispatcher
                .call_v1_internal("generateContent", request("gemini-2.5-flash"))
                .await
                .unwrap();

            assert!(resp.is_success());
            assert_eq!(http.call_count(), 1);
        }

        /// Scenario: the first account answers 429 with a RetryInfo delay;
        /// the dispatcher rotates to the second account and succeeds.
        #[tokio::test(start_paused = true)]
        async fn rotates_to_next_account_on_429() {
            let http = Arc::new(ScriptedHttpClient::new());
            http.push_call(Ok(retry_info_429("0.1s")));
            http.push_call(Ok(ok_response(200, r#"{"ok":true}"#)));
            let manager = manager_with_accounts(2, http.clone()).await;

            let dispatcher = UpstreamDispatcher::new(manager, http.clone());
            dispatcher.initial_sweep_done.store(true, Ordering::SeqCst);

            let resp = dispatcher
                .call_v1_internal("generateContent", request("gemini-2.5-flash"))
                .await
                .unwrap();

            assert!(resp.is_success());
            assert_eq!(http.call_count(), 2);
        }

        /// Scenario: every account is already known-zero and a cached error
        /// exists for the model — the dispatcher fast-fails without calling
        /// upstream at all.
        #[tokio::test(start_paused = true)]
        async fn fast_fails_when_every_account_is_known_zero() {
            let http = Arc::new(ScriptedHttpClient::new());
            let manager = manager_with_accounts(2, http.clone()).await;
            let ids = manager.account_ids().await;

            let dispatcher = UpstreamDispatcher::new(manager, http.clone());
            dispatcher.initial_sweep_done.store(true, Ordering::SeqCst);

            let now = now_ms();
            for id in &ids {
                dispatcher.quota.record_observation("gemini-2.5-flash", id, Some(0.0), None, None, now).await;
            }
            dispatcher
                .quota
                .cache_error("gemini-2.5-flash", 429, HashMap::new(), "quota exhausted".into(), now)
                .await;

            let resp = dispatcher
                .call_v1_internal("generateContent", request("gemini-2.5-flash"))
                .await
                .unwrap();

            assert_eq!(resp.status, 429);
            assert_eq!(resp.body_text, "quota exhausted");
            assert_eq!(http.call_count(), 0, "fast-fail must not reach upstream");
        }

        /// Scenario: a single-account pool hits a network error, retries the
        /// same account once after the fixed delay, and that retry succeeds.
        #[tokio::test(start_paused = true)]
        async fn single_attempt_network_error_retries_same_account_once() {
            let http = Arc::new(ScriptedHttpClient::new());
            http.push_call(Err(gateway_auth::Error::Http("connection reset".into())));
            http.push_call(Ok(ok_response(200, r#"{"ok":true}"#)));
            let manager = manager_with_accounts(1, http.clone()).await;

            let dispatcher = UpstreamDispatcher::new(manager, http.clone());
            dispatcher.initial_sweep_done.store(true, Ordering::SeqCst);

            let resp = dispatcher
                .call_v1_internal("generateContent", request("gemini-2.5-flash"))
                .await
                .unwrap();

            assert!(resp.is_success());
            assert_eq!(http.call_count(), 2);
        }
    }
}
