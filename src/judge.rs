use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, JudgeError};

/// Request envelope for an opaque text judge.
#[derive(Debug, Clone)]
pub struct JudgeRequest<'a> {
    pub system: &'a str,
    pub prompt: &'a str,
    pub model: &'a str,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Anything that turns a prompt into raw text. The caller owns parsing.
pub trait TextJudge: Send + Sync {
    fn judge<'a>(&'a self, request: JudgeRequest<'a>) -> BoxFuture<'a, Result<String, JudgeError>>;
}

/// Text judge backed by the Anthropic messages API.
pub struct AnthropicJudge {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicJudge {
    pub fn new(api_key: String, base_url: String) -> Result<Self, JudgeError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call(&self, request: JudgeRequest<'_>) -> Result<String, JudgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.trim()).map_err(|_| JudgeError::Status {
                kind: ErrorKind::Api,
                status: 401,
                message: "invalid Anthropic API key".to_string(),
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let body = AnthropicRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: request.prompt,
            }],
        };
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(request.timeout)
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(JudgeError::Status {
                kind: ErrorKind::from_status(status),
                status: status.as_u16(),
                message,
            });
        }

        let parsed: AnthropicResponse = resp.json().await.map_err(|e| JudgeError::InvalidResponse {
            message: e.to_string(),
        })?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text)
    }
}

impl TextJudge for AnthropicJudge {
    fn judge<'a>(&'a self, request: JudgeRequest<'a>) -> BoxFuture<'a, Result<String, JudgeError>> {
        Box::pin(self.call(request))
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
