//! Per-`(modelId, accountKey)` quota cache and per-model cached-error store.

use std::collections::HashMap;

/// A quota observation for one `(model, account)` pair. Never deleted —
/// sweeps and 429s overwrite it; a stale entry is simply not "fresh", which
/// this crate does not track (no TTL, per the open question in the design
/// notes).
#[derive(Debug, Clone, Default)]
pub struct QuotaEntry {
    pub remaining_fraction: Option<f64>,
    pub reset_time: Option<String>,
    pub reset_time_ms: Option<u64>,
    pub cooldown_until_ms: u64,
    pub updated_at_ms: u64,
}

impl QuotaEntry {
    /// Derived integer percent, `None` if unknown.
    pub fn remaining_percent(&self) -> Option<u8> {
        self.remaining_fraction
            .map(|f| (f.clamp(0.0, 1.0) * 100.0).round() as u8)
    }

    pub fn is_known(&self) -> bool {
        self.remaining_percent().is_some()
    }

    pub fn is_known_zero(&self) -> bool {
        self.remaining_percent() == Some(0)
    }

    pub fn is_cooldown_active(&self, now_ms: u64) -> bool {
        self.cooldown_until_ms > now_ms
    }
}

/// Last non-2xx upstream response for a model, used for fast-fail.
#[derive(Debug, Clone)]
pub struct CachedError {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_text: String,
    pub cached_at_ms: u64,
}

/// Thread-safe store for both caches. A plain `RwLock<HashMap<..>>` per the
/// design notes: readers tolerate staleness by construction, and no eviction
/// bound is mandated, so an LRU layer would be speculative engineering for a
/// limit nothing in this contract specifies.
#[derive(Default)]
pub struct QuotaStore {
    entries: tokio::sync::RwLock<HashMap<(String, String), QuotaEntry>>,
    errors: tokio::sync::RwLock<HashMap<String, CachedError>>,
}

impl QuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, model_id: &str, account_id: &str) -> Option<QuotaEntry> {
        self.entries
            .read()
            .await
            .get(&(model_id.to_string(), account_id.to_string()))
            .cloned()
    }

    pub async fn record_observation(
        &self,
        model_id: &str,
        account_id: &str,
        remaining_fraction: Option<f64>,
        reset_time: Option<String>,
        reset_time_ms: Option<u64>,
        now_ms: u64,
    ) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry((model_id.to_string(), account_id.to_string()))
            .or_default();
        entry.remaining_fraction = remaining_fraction;
        entry.reset_time = reset_time;
        entry.reset_time_ms = reset_time_ms;
        entry.updated_at_ms = now_ms;
    }

    pub async fn set_cooldown(&self, model_id: &str, account_id: &str, until_ms: u64, now_ms: u64) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry((model_id.to_string(), account_id.to_string()))
            .or_default();
        entry.cooldown_until_ms = until_ms;
        entry.updated_at_ms = now_ms;
    }

    /// Every account in `account_ids` has a known, zero-remaining entry for
    /// this model. An account with no observation at all (unknown) blocks
    /// fast-fail — "known-zero" requires both knowledge and zero.
    pub async fn all_known_zero(&self, model_id: &str, account_ids: &[String]) -> bool {
        if account_ids.is_empty() {
            return false;
        }
        let entries = self.entries.read().await;
        account_ids.iter().all(|id| {
            entries
                .get(&(model_id.to_string(), id.clone()))
                .is_some_and(QuotaEntry::is_known_zero)
        })
    }

    pub async fn cached_error(&self, model_id: &str) -> Option<CachedError> {
        self.errors.read().await.get(model_id).cloned()
    }

    pub async fn cache_error(
        &self,
        model_id: &str,
        status: u16,
        headers: HashMap<String, String>,
        body_text: String,
        now_ms: u64,
    ) {
        self.errors.write().await.insert(
            model_id.to_string(),
            CachedError {
                status,
                headers,
                body_text,
                cached_at_ms: now_ms,
            },
        );
    }
}
