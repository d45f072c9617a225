use std::time::Duration;

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::prelude::*;
use rig::providers::gemini;
use serde_json::{json, Value};
use tracing::debug;

use super::llm::{BackendError, CompletionBackend, ModelCall, TextStream};
use super::sse;
use crate::config::ApiKey;
use crate::models::ProviderKind;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

type GeminiAgent = rig::agent::Agent<gemini::completion::CompletionModel>;

pub struct GeminiBackend {
    client: gemini::Client,
    http: reqwest::Client,
    api_key: ApiKey,
    base_url: String,
    idle_timeout: Duration,
}

/// `generationConfig` block. The rig client merges it over its own, so the
/// sampling options are repeated here.
fn generation_config(call: &ModelCall<'_>) -> Value {
    let mut config = json!({
        "temperature": call.temperature,
        "maxOutputTokens": call.max_tokens,
    });
    if call.json_mode {
        config["responseMimeType"] = json!("application/json");
    }
    config
}

impl GeminiBackend {
    pub fn new(api_key: ApiKey, base_url: Option<&str>, timeout: Duration) -> Self {
        let base_url = base_url.unwrap_or(GEMINI_BASE_URL).trim_end_matches('/').to_string();
        let client = gemini::Client::from_url(api_key.expose(), &base_url);
        Self {
            client,
            http: sse::streaming_client(timeout),
            api_key,
            base_url,
            idle_timeout: timeout,
        }
    }

    fn agent(&self, call: &ModelCall<'_>) -> GeminiAgent {
        self.client
            .agent(call.model)
            .preamble(call.system)
            .temperature(call.temperature)
            .max_tokens(u64::from(call.max_tokens))
            .additional_params(json!({"generationConfig": generation_config(call)}))
            .build()
    }

    fn stream_url(&self, model: &str) -> String {
        let model = model.trim_start_matches("models/");
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        )
    }

    fn stream_body(call: &ModelCall<'_>) -> Value {
        json!({
            "systemInstruction": {"parts": [{"text": call.system}]},
            "contents": [{"role": "user", "parts": [{"text": call.prompt}]}],
            "generationConfig": generation_config(call),
        })
    }
}

fn candidate_text(event: &Value) -> Option<String> {
    let parts = event.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn complete(&self, call: &ModelCall<'_>) -> Result<String, BackendError> {
        let agent = self.agent(call);
        debug!(model = call.model, json_mode = call.json_mode, "gemini completion");
        agent
            .prompt(call.prompt)
            .await
            .map_err(|e| BackendError::classify(call.model, e.to_string()))
    }

    async fn stream(&self, call: &ModelCall<'_>) -> Result<TextStream, BackendError> {
        debug!(model = call.model, json_mode = call.json_mode, "gemini stream");
        let response = self
            .http
            .post(self.stream_url(call.model))
            .header("x-goog-api-key", self.api_key.expose())
            .json(&Self::stream_body(call))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(call.model, status.as_u16(), &body));
        }
        Ok(sse::text_stream(response, candidate_text, self.idle_timeout))
    }
}
