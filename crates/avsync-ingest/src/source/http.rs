//! HTTP client for the operational system's REST API
//!
//! Authenticates with OAuth2 client credentials and caches the bearer token
//! until shortly before it expires. Data endpoints are paged with `Page` and
//! `PageSize` and bounded with `StartDate` / `EndDate`.

use super::{PageRequest, SourceClient};
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::types::OperatorId;
use anyhow::Context;
use async_trait::async_trait;
use avsync_common::time::format_api_timestamp;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

// ============================================================================
// API Constants
// ============================================================================

const TOKEN_PATH: &str = "oauth/token";
const DATA_PATH: &str = "connect/v1";

/// Token lifetime assumed when the server does not state one
const DEFAULT_TOKEN_TTL_SECS: u64 = 20;

/// Tokens are refreshed this long before they expire
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 5;

const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct HttpSourceClient {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl HttpSourceClient {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<AccessToken, SourceError> {
        debug!(url = %self.url(TOKEN_PATH), "Requesting access token");

        let response = self
            .client
            .post(self.url(TOKEN_PATH))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(SourceError::Auth(format!("token request rejected with {status}")));
        }
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body: TokenResponse = response.json().await.map_err(body_error)?;
        let ttl = body
            .expires_in
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS)
            .saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);

        Ok(AccessToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_page(
        &self,
        operator: &OperatorId,
        request: &PageRequest,
    ) -> Result<Vec<Value>, SourceError> {
        let url = self.url(&format!("{DATA_PATH}/{}", request.endpoint));
        let query = query_params(request);
        let mut reauthenticated = false;

        loop {
            let token = self.access_token().await?;
            debug!(
                operator = %operator,
                endpoint = request.endpoint,
                page = request.page,
                "Fetching source page"
            );

            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(transport_error)?;

            match response.status() {
                StatusCode::UNAUTHORIZED if !reauthenticated => {
                    // Token revoked or expired early
                    self.invalidate_token().await;
                    reauthenticated = true;
                },
                status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                    return Err(SourceError::Auth(format!(
                        "{} rejected with {status}",
                        request.endpoint
                    )));
                },
                status if status.is_success() => {
                    let body: Value = response.json().await.map_err(body_error)?;
                    return match body {
                        Value::Array(records) => Ok(records),
                        other => Err(SourceError::InvalidResponse(format!(
                            "expected a JSON array from {}, got {}",
                            request.endpoint,
                            json_type(&other)
                        ))),
                    };
                },
                status => return Err(status_error(status)),
            }
        }
    }
}

fn query_params(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("Page", request.page.to_string()),
        ("PageSize", request.page_size.to_string()),
    ];
    if let Some(since) = &request.window.since {
        query.push(("StartDate", format_api_timestamp(since)));
    }
    if let Some(until) = &request.window.until {
        query.push(("EndDate", format_api_timestamp(until)));
    }
    query
}

fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Transient(err.to_string())
    }
}

fn body_error(err: reqwest::Error) -> SourceError {
    if err.is_decode() {
        SourceError::InvalidResponse(err.to_string())
    } else {
        transport_error(err)
    }
}

fn status_error(status: StatusCode) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SourceError::Transient(format!("HTTP {status}"))
    } else {
        SourceError::InvalidResponse(format!("HTTP {status}"))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
