use std::time::Duration;

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::prelude::*;
use rig::providers::openai;
use serde_json::{json, Value};
use tracing::debug;

use super::llm::{BackendError, CompletionBackend, ModelCall, TextStream};
use super::sse;
use crate::config::ApiKey;
use crate::models::ProviderKind;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

type OpenAiAgent = rig::agent::Agent<openai::CompletionModel>;

pub struct OpenAiBackend {
    client: openai::Client,
    http: reqwest::Client,
    api_key: ApiKey,
    base_url: String,
    idle_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(api_key: ApiKey, base_url: Option<&str>, timeout: Duration) -> Self {
        let base_url = base_url.unwrap_or(OPENAI_BASE_URL).trim_end_matches('/').to_string();
        let client = openai::Client::from_url(api_key.expose(), &base_url);
        Self {
            client,
            http: sse::streaming_client(timeout),
            api_key,
            base_url,
            idle_timeout: timeout,
        }
    }

    fn agent(&self, call: &ModelCall<'_>) -> OpenAiAgent {
        let builder = self
            .client
            .agent(call.model)
            .preamble(call.system)
            .temperature(call.temperature)
            .max_tokens(u64::from(call.max_tokens));
        if call.json_mode {
            builder
                .additional_params(json!({"response_format": {"type": "json_object"}}))
                .build()
        } else {
            builder.build()
        }
    }

    fn stream_body(call: &ModelCall<'_>) -> Value {
        let mut body = json!({
            "model": call.model,
            "stream": true,
            "temperature": call.temperature,
            "max_tokens": call.max_tokens,
            "messages": [
                {"role": "system", "content": call.system},
                {"role": "user", "content": call.prompt}
            ]
        });
        if call.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

fn delta_text(event: &Value) -> Option<String> {
    event
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(&self, call: &ModelCall<'_>) -> Result<String, BackendError> {
        let agent = self.agent(call);
        debug!(model = call.model, json_mode = call.json_mode, "openai completion");
        agent
            .prompt(call.prompt)
            .await
            .map_err(|e| BackendError::classify(call.model, e.to_string()))
    }

    async fn stream(&self, call: &ModelCall<'_>) -> Result<TextStream, BackendError> {
        debug!(model = call.model, json_mode = call.json_mode, "openai stream");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(&Self::stream_body(call))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(call.model, status.as_u16(), &body));
        }
        Ok(sse::text_stream(response, delta_text, self.idle_timeout))
    }
}
