use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ai::{AiClient, AiError, AiReply, ContextMessage};
use crate::error::AppError;

/// HTTP client for the Contextual AI query API.
pub struct ContextualClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    datastore_id: &'a str,
    messages: Vec<WireMessage<'a>>,
}

/// The service has answered under different field names across versions;
/// accept any of them.
#[derive(Deserialize)]
struct QueryResponse {
    response: Option<String>,
    message: Option<String>,
    content: Option<String>,
    token_count: Option<i64>,
}

impl ContextualClient {
    pub fn new(api_key: String, base_url: String, timeout_secs: u64) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build AI http client: {}", e)))?;

        Ok(ContextualClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl AiClient for ContextualClient {
    async fn send_message(
        &self,
        datastore_id: &str,
        content: &str,
        context: &[ContextMessage],
    ) -> Result<AiReply, AiError> {
        let mut messages: Vec<WireMessage> = context
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();
        messages.push(WireMessage {
            role: "user",
            content,
        });

        tracing::debug!(
            datastore_id,
            context_len = context.len(),
            "querying AI service"
        );

        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&QueryRequest {
                datastore_id,
                messages,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: QueryResponse = response.json().await.map_err(|e| {
            tracing::warn!(error = %e, "AI response was not valid JSON");
            AiError::MalformedResponse
        })?;

        let text = body
            .response
            .or(body.message)
            .or(body.content)
            .ok_or(AiError::MalformedResponse)?;
        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }

        Ok(AiReply {
            text,
            token_count: body.token_count.unwrap_or(0).max(0),
        })
    }
}
