//! The client's view of the server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::error::{ClientError, ClientResult};
use super::outbox::OutboxItem;
use crate::constants::OUTBOX_ID_HEADER;
use crate::error::ErrorEnvelope;
use crate::models::{BootstrapSnapshot, PublicMember, SyncPage};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Replays one queued mutation, sending its id as the idempotency token.
    async fn send(&self, item: &OutboxItem) -> ClientResult<Value>;

    async fn pull(&self, cursor: i64, limit: u32) -> ClientResult<SyncPage>;

    async fn bootstrap(&self) -> ClientResult<BootstrapSnapshot>;
}

/// `reqwest` transport. The session cookie from `login` is kept in the
/// client's cookie store and sent on every later request.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn login(&self, username: &str, password: &str) -> ClientResult<PublicMember> {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
            tracing::debug!(status = status.as_u16(), body = %preview, "server rejected request");

            return Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(envelope) => {
                    let message = serde_json::to_value(&envelope.error)
                        .ok()
                        .and_then(|value| {
                            value
                                .get("message")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .unwrap_or_else(|| format!("Request failed with {}", status));
                    ClientError::api(status.as_u16(), message, Some(envelope.error))
                }
                Err(_) => ClientError::api(status.as_u16(), format!("Request failed: {}", preview), None),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, item: &OutboxItem) -> ClientResult<Value> {
        let method = reqwest::Method::from_bytes(item.method.as_bytes())
            .map_err(|_| ClientError::invalid_request(format!("Bad HTTP method {}", item.method)))?;
        let token = HeaderValue::from_str(&item.id)
            .map_err(|_| ClientError::invalid_request("Outbox id is not a valid header value"))?;

        let mut request = self
            .client
            .request(method, self.url(&item.path))
            .header(OUTBOX_ID_HEADER, token);
        if let Some(body) = item.request_body()? {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(serde_json::to_vec(&body)?);
        }

        let response = request.send().await?;
        Self::parse_response(response).await
    }

    async fn pull(&self, cursor: i64, limit: u32) -> ClientResult<SyncPage> {
        let response = self
            .client
            .get(self.url("/sync"))
            .query(&[("cursor", cursor.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn bootstrap(&self) -> ClientResult<BootstrapSnapshot> {
        let response = self.client.get(self.url("/bootstrap")).send().await?;
        Self::parse_response(response).await
    }
}
