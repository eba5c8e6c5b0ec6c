//! Scriptable fake `HttpClient` shared by `account_manager` and `dispatcher`
//! tests. Not compiled outside test builds.
#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use gateway_auth::{
    CallOptions, FetchProjectIdOptions, HttpClient, HttpResponse, ModelQuota, RefreshedTokens,
    Result as AuthResult,
};
use serde_json::Value;
use tokio::sync::Notify;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = AuthResult<T>> + Send + 'a>>;

/// Every method pulls its next scripted answer from a queue; an empty queue
/// returns a harmless default rather than panicking, so tests only script
/// the calls they care about.
#[derive(Default)]
pub struct ScriptedHttpClient {
    pub refresh_responses: Mutex<VecDeque<AuthResult<RefreshedTokens>>>,
    pub project_id_responses: Mutex<VecDeque<AuthResult<String>>>,
    pub available_models: Mutex<HashMap<String, ModelQuota>>,
    pub call_responses: Mutex<VecDeque<AuthResult<HttpResponse>>>,
    pub call_log: Mutex<Vec<String>>,
    /// When set, `refresh_token` waits on this before consuming a scripted
    /// response — lets a concurrency test hold a refresh attempt open long
    /// enough for a second caller to join it.
    pub refresh_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_refresh(&self, result: AuthResult<RefreshedTokens>) {
        self.refresh_responses.lock().unwrap().push_back(result);
    }

    /// Makes `refresh_token` block until `gate.notify_waiters()` is called.
    pub fn gate_refresh(&self, gate: Arc<Notify>) {
        *self.refresh_gate.lock().unwrap() = Some(gate);
    }

    pub fn push_project_id(&self, result: AuthResult<String>) {
        self.project_id_responses.lock().unwrap().push_back(result);
    }

    pub fn push_call(&self, result: AuthResult<HttpResponse>) {
        self.call_responses.lock().unwrap().push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().unwrap().len()
    }
}

pub fn ok_response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body_text: body.to_string(),
    }
}

pub fn retry_info_429(retry_delay: &str) -> HttpResponse {
    HttpResponse {
        status: 429,
        headers: HashMap::new(),
        body_text: format!(
            r#"{{"error":{{"details":[{{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"{retry_delay}"}}]}}}}"#
        ),
    }
}

impl HttpClient for ScriptedHttpClient {
    fn refresh_token<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, RefreshedTokens> {
        Box::pin(async move {
            let gate = self.refresh_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.refresh_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(RefreshedTokens {
                        access_token: "refreshed-token".into(),
                        refresh_token: "refreshed-refresh".into(),
                        token_type: Some("Bearer".into()),
                        scope: None,
                        expiry_date: crate::iso_time::now_ms() + 3_600_000,
                    })
                })
        })
    }

    fn fetch_user_info<'a>(&'a self, _access_token: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { Ok(None) })
    }

    fn fetch_project_id<'a>(
        &'a self,
        _access_token: &'a str,
        _options: FetchProjectIdOptions,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            self.project_id_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("project-default".to_string()))
        })
    }

    fn fetch_available_models<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> BoxFuture<'a, HashMap<String, ModelQuota>> {
        Box::pin(async move { Ok(self.available_models.lock().unwrap().clone()) })
    }

    fn call_v1_internal<'a>(
        &'a self,
        method: &'a str,
        _access_token: &'a str,
        _body: &'a Value,
        _options: CallOptions,
    ) -> BoxFuture<'a, HttpResponse> {
        Box::pin(async move {
            self.call_log.lock().unwrap().push(method.to_string());
            self.call_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_response(200, "{}")))
        })
    }
}
