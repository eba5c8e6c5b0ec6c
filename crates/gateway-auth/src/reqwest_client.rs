//! Concrete `HttpClient` backed by `reqwest`.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{
    AVAILABLE_MODELS_ENDPOINT, PROJECT_ID_ENDPOINT, TOKEN_ENDPOINT, USERINFO_ENDPOINT,
    V1INTERNAL_BASE,
};
use crate::error::{Error, Result};
use crate::http_client::{
    CallOptions, FetchProjectIdOptions, HttpClient, HttpResponse, ModelQuota, RefreshedTokens,
};

/// Base delay between `fetch_project_id` retry attempts; grows linearly with
/// attempt number (attempt 1 waits one unit, attempt 2 waits two, ...).
const PROJECT_ID_RETRY_BASE_MS: u64 = 500;

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    expires_in: u64,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct ProjectIdResponse {
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Deserialize)]
struct QuotaInfo {
    #[serde(default)]
    remaining_fraction: f64,
    #[serde(default)]
    reset_time: Option<String>,
}

#[derive(Deserialize)]
struct ModelEntry {
    #[serde(default)]
    quota_info: Option<QuotaInfo>,
}

#[derive(Deserialize)]
struct AvailableModelsResponse {
    #[serde(default)]
    models: HashMap<String, ModelEntry>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

impl HttpClient for ReqwestHttpClient {
    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<RefreshedTokens>> + Send + 'a>> {
        Box::pin(async move {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ];
            let resp = self
                .client
                .post(TOKEN_ENDPOINT)
                .form(&form)
                .send()
                .await
                .map_err(|e| Error::Http(e.to_string()))?;

            let status = resp.status();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::InvalidCredentials(body));
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::TokenExchange(format!("status {status}: {body}")));
            }

            let parsed: TokenExchangeResponse = resp
                .json()
                .await
                .map_err(|e| Error::TokenExchange(format!("decoding response: {e}")))?;

            Ok(RefreshedTokens {
                access_token: parsed.access_token,
                refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
                token_type: parsed.token_type,
                scope: parsed.scope,
                expiry_date: now_ms() + parsed.expires_in * 1000,
            })
        })
    }

    fn fetch_user_info<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(USERINFO_ENDPOINT)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| Error::Http(e.to_string()))?;

            if !resp.status().is_success() {
                debug!(status = %resp.status(), "fetch_user_info non-2xx, treating as unknown email");
                return Ok(None);
            }
            let parsed: UserInfoResponse = resp
                .json()
                .await
                .map_err(|e| Error::Http(format!("decoding user info: {e}")))?;
            Ok(parsed.email)
        })
    }

    fn fetch_project_id<'a>(
        &'a self,
        access_token: &'a str,
        options: FetchProjectIdOptions,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let max_attempts = options.max_attempts.max(1);
            let mut last_err = None;

            for attempt in 1..=max_attempts {
                let result = self
                    .client
                    .post(PROJECT_ID_ENDPOINT)
                    .bearer_auth(access_token)
                    .json(&serde_json::json!({}))
                    .send()
                    .await;

                match result {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<ProjectIdResponse>().await {
                            Ok(parsed) => {
                                if let Some(id) = parsed.project_id.filter(|id| !id.is_empty()) {
                                    return Ok(id);
                                }
                                last_err = Some("empty project id".to_string());
                            }
                            Err(e) => last_err = Some(format!("decoding project id: {e}")),
                        }
                    }
                    Ok(resp) => last_err = Some(format!("status {}", resp.status())),
                    Err(e) => last_err = Some(e.to_string()),
                }

                if attempt < max_attempts {
                    warn!(attempt, max_attempts, "fetch_project_id attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(PROJECT_ID_RETRY_BASE_MS * attempt as u64))
                        .await;
                }
            }

            Err(Error::ProjectIdUnresolved(
                last_err.unwrap_or_else(|| "exhausted retry budget".into()),
            ))
        })
    }

    fn fetch_available_models<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<HashMap<String, ModelQuota>>> + Send + 'a>>
    {
        Box::pin(async move {
            let resp = self
                .client
                .get(AVAILABLE_MODELS_ENDPOINT)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| Error::Http(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(Error::Http(format!(
                    "fetch_available_models status {}",
                    resp.status()
                )));
            }

            let parsed: AvailableModelsResponse = resp
                .json()
                .await
                .map_err(|e| Error::Http(format!("decoding available models: {e}")))?;

            Ok(parsed
                .models
                .into_iter()
                .map(|(model_id, entry)| {
                    let quota = entry.quota_info.unwrap_or(QuotaInfo {
                        remaining_fraction: 0.0,
                        reset_time: None,
                    });
                    (
                        model_id,
                        ModelQuota {
                            remaining_fraction: quota.remaining_fraction,
                            reset_time: quota.reset_time,
                        },
                    )
                })
                .collect())
        })
    }

    fn call_v1_internal<'a>(
        &'a self,
        method: &'a str,
        access_token: &'a str,
        body: &'a Value,
        options: CallOptions,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<HttpResponse>> + Send + 'a>> {
        Box::pin(async move {
            let mut url = format!("{V1INTERNAL_BASE}:{method}");
            if let Some(qs) = &options.query_string {
                url.push('?');
                url.push_str(qs);
            }

            let mut req = self.client.post(&url).bearer_auth(access_token).json(body);
            for (key, value) in &options.headers {
                req = req.header(key, value);
            }

            let resp = req.send().await.map_err(|e| Error::Http(e.to_string()))?;
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let body_text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

            Ok(HttpResponse {
                status,
                headers,
                body_text,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_success_checks_2xx_range() {
        let ok = HttpResponse {
            status: 204,
            headers: HashMap::new(),
            body_text: String::new(),
        };
        assert!(ok.is_success());

        let not_ok = HttpResponse {
            status: 429,
            headers: HashMap::new(),
            body_text: String::new(),
        };
        assert!(!not_ok.is_success());
    }
}
