//! Account data model.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use gateway_auth::Credentials;
use tokio::sync::{Mutex, Notify, RwLock};

/// `claude` or `gemini`: independent current-indices and model-name inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Claude,
    Gemini,
}

impl Group {
    /// `group` is inferred from the model string if absent: contains
    /// "claude" → claude; contains "gemini" or unknown → gemini.
    pub fn infer_from_model(model: &str) -> Self {
        if model.to_lowercase().contains("claude") {
            Group::Claude
        } else {
            Group::Gemini
        }
    }
}

/// A single `refreshToken` attempt shared by every caller that joins before
/// it resolves. `result` is written exactly once, by whichever caller became
/// the leader; followers wait on `done` and then read it.
#[derive(Default)]
pub(crate) struct InflightRefresh {
    pub(crate) done: Notify,
    pub(crate) result: OnceLock<Result<(), String>>,
}

/// One account slot in the rotation pool. Held behind `Arc` everywhere so
/// that an `Arc` pointer's identity survives list mutation — deleting a
/// different slot never invalidates a caller's reference to this one.
pub struct AccountSlot {
    /// The credential file's base name (without extension); stable for the
    /// life of the account.
    pub id: String,
    pub path: PathBuf,

    state: RwLock<Credentials>,

    /// The single in-flight `refreshToken` attempt for this account, if one
    /// is currently running. A caller that finds one here joins it and is
    /// handed its exact result — success or failure — instead of starting a
    /// second attempt. The leader clears this back to `None` once the
    /// attempt resolves, so a caller arriving afterward starts a fresh one
    /// rather than replaying a stale outcome.
    pub(crate) refresh_inflight: Mutex<Option<Arc<InflightRefresh>>>,
    /// Guards project-id resolution: at most one fetch in flight per
    /// account. Callers acquire this, then re-check under `state`'s read
    /// lock whether resolution already completed — a double-checked-locking
    /// single-flight.
    pub(crate) project_id_gate: Mutex<()>,

    /// Set while a refresh or project-id resolution is actually running
    /// (as opposed to merely waiting on the gate) — exposed for tests and
    /// for summary reporting, not itself part of the coalescing logic.
    pub(crate) refreshing: AtomicBool,
}

impl AccountSlot {
    pub fn new(id: String, path: PathBuf, credentials: Credentials) -> Self {
        Self {
            id,
            path,
            state: RwLock::new(credentials),
            refresh_inflight: Mutex::new(None),
            project_id_gate: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub async fn snapshot(&self) -> Credentials {
        self.state.read().await.clone()
    }

    pub(crate) async fn replace(&self, new: Credentials) {
        *self.state.write().await = new;
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }
}

/// Per-group current index, adjusted on insertion/deletion to stay in range
/// and never to silently jump across surviving accounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupIndices {
    pub claude: usize,
    pub gemini: usize,
}

impl GroupIndices {
    pub fn get(&self, group: Group) -> usize {
        match group {
            Group::Claude => self.claude,
            Group::Gemini => self.gemini,
        }
    }

    pub fn set(&mut self, group: Group, value: usize) {
        match group {
            Group::Claude => self.claude = value,
            Group::Gemini => self.gemini = value,
        }
    }

    /// Adjust both indices after removing the slot at `removed_index` out of
    /// a (pre-removal) list of `old_len` accounts.
    pub fn adjust_for_removal(&mut self, removed_index: usize, old_len: usize) {
        let new_last = old_len.saturating_sub(2); // old_len - 1 accounts remain, last valid index
        for group in [Group::Claude, Group::Gemini] {
            let current = self.get(group);
            let adjusted = match current.cmp(&removed_index) {
                std::cmp::Ordering::Less => current,
                std::cmp::Ordering::Equal => current.min(new_last),
                std::cmp::Ordering::Greater => current - 1,
            };
            self.set(group, adjusted);
        }
    }
}

/// Resolved credentials for a single request, handed back by
/// `AccountManager::get_credentials_by_index` and friends.
#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub access_token: String,
    pub project_id: String,
    pub account_id: String,
    pub account_index: usize,
}

/// `{ok, fail, total}` returned by `refreshAllProjectIds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProjectIdRepairSummary {
    pub ok: usize,
    pub fail: usize,
    pub total: usize,
}
