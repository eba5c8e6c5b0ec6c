//! On-disk credential records
//!
//! One JSON file per account, unlike a single combined store: a directory of
//! `*.json` files, each holding one account's OAuth state. All writes use
//! atomic temp-file + rename so a reader never observes a partial record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// A single account's OAuth credential state.
///
/// `expiry_date` is a unix timestamp in milliseconds (absolute, not a delta).
/// `project_id_resolved_at` is only ever set together with a non-empty
/// `project_id` — its presence marks the id as authoritatively verified
/// rather than inherited unchecked from a previous record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry_date: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(rename = "projectIdResolvedAt", skip_serializing_if = "Option::is_none")]
    pub project_id_resolved_at: Option<String>,
}

impl Credentials {
    /// A credential is admitted by a directory scan only if it carries both
    /// tokens and at least one of `token_type`/`scope`.
    pub fn is_loadable(&self) -> bool {
        !self.access_token.is_empty()
            && !self.refresh_token.is_empty()
            && (self.token_type.is_some() || self.scope.is_some())
    }

    /// A verified project id has both the id and the resolved-at marker.
    pub fn has_verified_project_id(&self) -> bool {
        self.project_id.as_deref().is_some_and(|id| !id.is_empty())
            && self
                .project_id_resolved_at
                .as_deref()
                .is_some_and(|at| !at.is_empty())
    }
}

/// Read and parse a single credential file. Does not validate `is_loadable`.
pub async fn read_credentials(path: &Path) -> Result<Credentials> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(path.display().to_string())
        } else {
            Error::Io(format!("reading {}: {e}", path.display()))
        }
    })?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", path.display())))
}

/// Write a credential file atomically: temp file in the same directory, then
/// rename over the target. Sets 0600 permissions where the OS supports it.
pub async fn write_credentials_atomic(path: &Path, creds: &Credentials) -> Result<()> {
    let json = serde_json::to_string_pretty(creds)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating auth directory: {e}")))?;

    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("credential"),
        std::process::id()
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential record");
    Ok(())
}

/// Scan a directory for `*.json` credential records.
///
/// Each entry that fails to parse, or parses but fails `is_loadable`, is
/// silently skipped — a malformed or half-written file must not abort
/// startup for every other account. Returned in filename order so account
/// indices are deterministic across a cold restart.
pub async fn scan_accounts_dir(dir: &Path) -> Result<Vec<(String, PathBuf, Credentials)>> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating auth directory: {e}")))?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::Io(format!("reading auth directory: {e}")))?;

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Io(format!("iterating auth directory: {e}")))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        match read_credentials(&path).await {
            Ok(creds) if creds.is_loadable() => found.push((id, path, creds)),
            Ok(_) => debug!(path = %path.display(), "skipping credential missing required fields"),
            Err(e) => debug!(path = %path.display(), error = %e, "skipping unparseable credential file"),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Scrub an email into a filesystem-safe basename: only `[a-zA-Z0-9@.]`
/// survive, everything else becomes `_`.
pub fn sanitize_email_for_filename(email: &str) -> String {
    email
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '@' || c == '.' { c } else { '_' })
        .collect()
}

/// Filename for a newly-added account with no usable email.
pub fn fallback_filename(now_ms: u64) -> String {
    format!("oauth-{now_ms}.json")
}

/// Validate a filename supplied to `deleteAccountByFile`: no path separators,
/// no `..`, must end in `.json`.
pub fn validate_deletable_filename(name: &str) -> Result<()> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(Error::CredentialParse(format!(
            "refusing to delete unsafe filename: {name}"
        )));
    }
    if !name.ends_with(".json") {
        return Err(Error::CredentialParse(format!(
            "refusing to delete non-credential file: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_creds() -> Credentials {
        Credentials {
            access_token: "at_1".into(),
            refresh_token: "rt_1".into(),
            expiry_date: 4_102_444_800_000,
            token_type: Some("Bearer".into()),
            scope: None,
            email: Some("user@example.com".into()),
            project_id: None,
            project_id_resolved_at: None,
        }
    }

    #[tokio::test]
    async fn roundtrip_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user@example.com.json");
        write_credentials_atomic(&path, &test_creds()).await.unwrap();
        let loaded = read_credentials(&path).await.unwrap();
        assert_eq!(loaded, test_creds());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_sets_0600_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acct.json");
        write_credentials_atomic(&path, &test_creds()).await.unwrap();
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn scan_skips_unloadable_records() {
        let dir = tempfile::tempdir().unwrap();
        write_credentials_atomic(&dir.path().join("good.json"), &test_creds())
            .await
            .unwrap();

        let mut missing_scope = test_creds();
        missing_scope.token_type = None;
        missing_scope.scope = None;
        write_credentials_atomic(&dir.path().join("bad.json"), &missing_scope)
            .await
            .unwrap();

        tokio::fs::write(dir.path().join("garbage.json"), b"not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"ignore me")
            .await
            .unwrap();

        let found = scan_accounts_dir(dir.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "good");
    }

    #[test]
    fn sanitizes_email_special_characters() {
        assert_eq!(
            sanitize_email_for_filename("a+b.test@Example.com"),
            "a_b.test@Example.com"
        );
    }

    #[test]
    fn validate_deletable_filename_rejects_traversal() {
        assert!(validate_deletable_filename("../../etc/passwd").is_err());
        assert!(validate_deletable_filename("sub/dir.json").is_err());
        assert!(validate_deletable_filename("account.txt").is_err());
        assert!(validate_deletable_filename("account.json").is_ok());
    }

    #[test]
    fn is_loadable_requires_tokens_and_type_or_scope() {
        let mut c = test_creds();
        c.token_type = None;
        c.scope = None;
        assert!(!c.is_loadable());
        c.scope = Some("x".into());
        assert!(c.is_loadable());
    }

    #[tokio::test]
    async fn read_credentials_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_credentials(&dir.path().join("absent.json")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "expected NotFound, got {err:?}");
    }

    #[test]
    fn verified_project_id_requires_both_fields() {
        let mut c = test_creds();
        assert!(!c.has_verified_project_id());
        c.project_id = Some("proj-1".into());
        assert!(!c.has_verified_project_id());
        c.project_id_resolved_at = Some("2026-01-01T00:00:00Z".into());
        assert!(c.has_verified_project_id());
    }
}
