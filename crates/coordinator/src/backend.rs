//! Chat-completions client for the model serving processes
//!
//! Every serving instance speaks the OpenAI chat-completions protocol at
//! `{base_url}/v1/chat/completions`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};
use triage_common::{ChatMessage, Result, TriageError};

/// Request body, field order matches what the serving processes expect
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Address and credential of one serving instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl BackendEndpoint {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

/// Performs one chat completion against a serving instance
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat_completion(
        &self,
        endpoint: &BackendEndpoint,
        request: &ChatCompletionRequest,
    ) -> Result<String>;
}

/// HTTP implementation backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TriageError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn classify(url: &str, e: reqwest::Error) -> TriageError {
    if e.is_timeout() {
        TriageError::backend_timeout(format!("{}: {}", url, e))
    } else {
        TriageError::backend_unavailable(format!("{}: {}", url, e))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn chat_completion(
        &self,
        endpoint: &BackendEndpoint,
        request: &ChatCompletionRequest,
    ) -> Result<String> {
        let url = endpoint.completions_url();
        debug!(url = %url, messages = request.messages.len(), "Sending chat completion");

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &endpoint.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| classify(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(url = %url, status = %status, "Backend returned an error");
            return Err(TriageError::backend_unavailable(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                classify(&url, e)
            } else {
                TriageError::backend_unavailable(format!("malformed response from {}: {}", url, e))
            }
        })?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| TriageError::backend_unavailable(format!("{} returned no choices", url)))
    }
}
