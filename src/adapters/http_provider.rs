use crate::domain::model::ExternalSession;
use crate::domain::ports::TrackingProvider;
use crate::utils::error::{ImportError, ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// 未提供到期資訊時的預設 session 壽命
const DEFAULT_SESSION_TTL_SECS: i64 = 600;

/// reqwest 實作的追蹤服務客戶端
#[derive(Debug, Clone)]
pub struct HttpTrackingProvider {
    client: Client,
    base_url: Url,
}

impl HttpTrackingProvider {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ImportError::InvalidConfigValueError {
                field: "provider.base_url".to_string(),
                value: base_url.to_string(),
                reason: e.to_string(),
            })?;
        // join() 會取代最後一段路徑
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ImportError::ConfigError {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::Other(format!("invalid endpoint {}: {}", path, e)))
    }
}

fn transport_error(error: reqwest::Error) -> ProviderError {
    ProviderError::Unavailable(error.to_string())
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// 依 HTTP 狀態碼與回應內容分類錯誤，成功時解開 `{data: ...}` 外層
async fn read_body(response: Response) -> std::result::Result<Value, ProviderError> {
    let status = response.status();
    tracing::debug!("Provider response status: {}", status);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited {
            retry_after: retry_after(&response),
        });
    }

    let text = response.text().await.map_err(transport_error)?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ProviderError::AuthExpired(format!("HTTP {}: {}", status, text)));
    }
    if status.is_server_error() {
        return Err(ProviderError::Unavailable(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(ProviderError::Other(format!("HTTP {}: {}", status, text)));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    let body: Value = serde_json::from_str(&text)
        .map_err(|e| ProviderError::Other(format!("invalid JSON response: {}", e)))?;

    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let message = match error {
            Value::String(message) => message.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return Err(ProviderError::Other(message));
    }

    match body {
        Value::Object(mut map) => match map.remove("data") {
            Some(data) => Ok(data),
            None => Ok(Value::Object(map)),
        },
        other => Ok(other),
    }
}

fn parse_session(body: &Value, principal: &str) -> std::result::Result<ExternalSession, ProviderError> {
    let token = body
        .get("token")
        .or_else(|| body.get("access_token"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProviderError::Other("login response missing token".to_string()))?;

    let expires_at = if let Some(raw) = body.get("expires_at").and_then(Value::as_str) {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ProviderError::Other(format!("invalid expires_at '{}': {}", raw, e)))?
    } else {
        let ttl = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_SESSION_TTL_SECS);
        Utc::now() + chrono::Duration::seconds(ttl)
    };

    Ok(ExternalSession::new(token, principal, expires_at))
}

#[async_trait]
impl TrackingProvider for HttpTrackingProvider {
    async fn login(
        &self,
        principal: &str,
        secret: &str,
    ) -> std::result::Result<ExternalSession, ProviderError> {
        tracing::debug!("🔐 Logging in to tracking provider as {}", principal);
        let response = self
            .client
            .post(self.endpoint("api/session")?)
            .json(&json!({ "principal": principal, "secret": secret }))
            .send()
            .await
            .map_err(transport_error)?;

        let body = read_body(response).await?;
        parse_session(&body, principal)
    }

    async fn query(
        &self,
        session: &ExternalSession,
        action: &str,
        params: &Value,
    ) -> std::result::Result<Value, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("api/query")?)
            .bearer_auth(&session.token)
            .json(&json!({ "action": action, "params": params }))
            .send()
            .await
            .map_err(transport_error)?;

        read_body(response).await
    }

    async fn logout(&self, session: &ExternalSession) -> std::result::Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.endpoint("api/session")?)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(transport_error)?;

        read_body(response).await.map(|_| ())
    }

    async fn check_session(
        &self,
        session: &ExternalSession,
    ) -> std::result::Result<(), ProviderError> {
        let response = self
            .client
            .get(self.endpoint("api/session")?)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(transport_error)?;

        read_body(response).await.map(|_| ())
    }

    async fn health_check(&self) -> std::result::Result<(), ProviderError> {
        let response = self
            .client
            .get(self.endpoint("api/health")?)
            .send()
            .await
            .map_err(transport_error)?;

        read_body(response).await.map(|_| ())
    }
}
