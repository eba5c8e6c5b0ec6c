//! Environment-driven configuration.
//!
//! Every reader here is memoized by the *raw* string value of its
//! environment variable, not read once at startup: if the variable changes
//! between calls (tests flipping `std::env::set_var`, or a long-lived
//! process reloading its environment) the memo invalidates itself on the
//! next read rather than serving a stale parse. This only matters for the
//! model maps, which are read on every request; the integer knobs are cheap
//! enough to re-parse each time.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Default spacing between `v1internal` calls sharing the default limiter.
pub const FIXED_RETRY_DELAY_MS: u64 = 1200;

/// Default quota-sweep interval.
pub const QUOTA_REFRESH_S_DEFAULT: u64 = 300;

/// How long the dispatcher waits at startup for the pool to become
/// non-empty and the initial refresh batch to finish, before its first sweep.
pub const INITIAL_QUOTA_WAIT_MS_DEFAULT: u64 = 3000;

fn read_non_negative_u64(var: &str, default: u64) -> u64 {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// `AG2API_RETRY_DELAY_MS`, default 1200.
pub fn retry_delay_ms() -> u64 {
    read_non_negative_u64("AG2API_RETRY_DELAY_MS", FIXED_RETRY_DELAY_MS)
}

/// `AG2API_QUOTA_REFRESH_S`, default 300.
pub fn quota_refresh_s() -> u64 {
    read_non_negative_u64("AG2API_QUOTA_REFRESH_S", QUOTA_REFRESH_S_DEFAULT)
}

/// `AG2API_INITIAL_QUOTA_WAIT_MS`, default 3000.
pub fn initial_quota_wait_ms() -> u64 {
    read_non_negative_u64(
        "AG2API_INITIAL_QUOTA_WAIT_MS",
        INITIAL_QUOTA_WAIT_MS_DEFAULT,
    )
}

struct ModelMapMemo {
    raw: String,
    parsed: HashMap<String, String>,
}

static CLAUDE_MODEL_MAP: OnceLock<Mutex<Option<ModelMapMemo>>> = OnceLock::new();
static GEMINI_MODEL_MAP: OnceLock<Mutex<Option<ModelMapMemo>>> = OnceLock::new();

/// Parse a `{fromModel: toModel}` JSON object: keys are lower-cased, entries
/// with an empty (post-trim) key or value are dropped.
pub fn parse_model_map(raw: &str) -> HashMap<String, String> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| {
            let key = k.trim().to_lowercase();
            let value = v.as_str()?.trim().to_string();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key, value))
            }
        })
        .collect()
}

fn memoized_model_map(var: &str, cell: &OnceLock<Mutex<Option<ModelMapMemo>>>) -> HashMap<String, String> {
    let raw = std::env::var(var).unwrap_or_default();
    let mutex = cell.get_or_init(|| Mutex::new(None));
    let mut guard = mutex.lock().expect("model map memo mutex poisoned");

    if let Some(memo) = guard.as_ref() {
        if memo.raw == raw {
            return memo.parsed.clone();
        }
    }

    let parsed = parse_model_map(&raw);
    *guard = Some(ModelMapMemo {
        raw,
        parsed: parsed.clone(),
    });
    parsed
}

/// `AG2API_CLAUDE_MODEL_MAP`.
pub fn claude_model_map() -> HashMap<String, String> {
    memoized_model_map("AG2API_CLAUDE_MODEL_MAP", &CLAUDE_MODEL_MAP)
}

/// `AG2API_GEMINI_MODEL_MAP`.
pub fn gemini_model_map() -> HashMap<String, String> {
    memoized_model_map("AG2API_GEMINI_MODEL_MAP", &GEMINI_MODEL_MAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Env vars are process-global; serialize the tests that touch them so
    /// they don't race against each other under the default parallel runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn invalid_integer_env_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("AG2API_RETRY_DELAY_MS", "not-a-number") };
        assert_eq!(retry_delay_ms(), FIXED_RETRY_DELAY_MS);
        unsafe { std::env::remove_var("AG2API_RETRY_DELAY_MS") };
    }

    #[test]
    fn unset_integer_env_uses_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("AG2API_QUOTA_REFRESH_S") };
        assert_eq!(quota_refresh_s(), QUOTA_REFRESH_S_DEFAULT);
    }

    #[test]
    fn parse_model_map_lowercases_and_drops_empties() {
        let raw = r#"{"Claude-Opus-4": "claude-opus-4-20250514", "": "dropped", "empty-value": ""}"#;
        let parsed = parse_model_map(raw);
        assert_eq!(
            parsed.get("claude-opus-4"),
            Some(&"claude-opus-4-20250514".to_string())
        );
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn parse_model_map_on_garbage_returns_empty() {
        assert!(parse_model_map("not json").is_empty());
        assert!(parse_model_map("[]").is_empty());
    }

    #[test]
    fn model_map_memo_invalidates_on_raw_value_change() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("AG2API_CLAUDE_MODEL_MAP", r#"{"a":"b"}"#) };
        let first = claude_model_map();
        assert_eq!(first.get("a"), Some(&"b".to_string()));

        unsafe { std::env::set_var("AG2API_CLAUDE_MODEL_MAP", r#"{"c":"d"}"#) };
        let second = claude_model_map();
        assert_eq!(second.get("c"), Some(&"d".to_string()));
        assert!(!second.contains_key("a"));

        unsafe { std::env::remove_var("AG2API_CLAUDE_MODEL_MAP") };
    }
}
