use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::AnalysisError;
use crate::models::{ProviderKind, ProviderRole, RawProviderResponse};
use crate::tokens::{estimate_tokens, max_output_tokens};

pub type TextStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("model `{model}` is not available: {message}")]
    ModelNotFound { model: String, message: String },

    /// The vendor rejected a request option (typically JSON mode).
    #[error("request option not supported: {0}")]
    UnsupportedConfig(String),

    #[error("credential rejected: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned an empty response")]
    EmptyResponse,
}

impl BackendError {
    /// Map an HTTP error status and body.
    pub fn from_status(model: &str, status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(format!("HTTP {status}: {body}")),
            404 => Self::ModelNotFound {
                model: model.to_string(),
                message: body.to_string(),
            },
            429 => Self::RateLimited(body.to_string()),
            400 => Self::classify(model, body),
            _ => Self::Request(format!("HTTP {status}: {body}")),
        }
    }

    /// Classify a vendor error message. Used where only the rendered error
    /// is available. A status code counts only when it follows `HTTP`,
    /// `status`, `code` or `error`.
    pub fn classify(model: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        let status = status_code(&lower);

        if status == Some(404)
            || any(&["model_not_found", "not_found", "does not exist", "is not found"])
        {
            Self::ModelNotFound {
                model: model.to_string(),
                message,
            }
        } else if matches!(status, Some(401 | 403))
            || any(&[
                "unauthorized",
                "invalid api key",
                "incorrect api key",
                "api key not valid",
                "permission_denied",
            ])
        {
            Self::Unauthorized(message)
        } else if any(&[
            "not supported",
            "unsupported",
            "unknown name",
            "unrecognized request argument",
            "invalid json payload",
        ]) {
            Self::UnsupportedConfig(message)
        } else if status == Some(429) || any(&["rate limit", "quota", "resource_exhausted"]) {
            Self::RateLimited(message)
        } else {
            Self::Request(message)
        }
    }

    pub fn is_model_not_found(&self) -> bool {
        matches!(self, Self::ModelNotFound { .. })
    }
}

fn status_code(lower: &str) -> Option<u16> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(?:http|status|code|error)\b[\s:=()"']*(\d{3})\b"#).expect("valid regex")
    })
    .captures(lower)
    .and_then(|caps| caps[1].parse().ok())
}

#[derive(Debug, Clone, Copy)]
pub struct ModelCall<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub prompt: &'a str,
    pub temperature: f64,
    pub max_tokens: u32,
    pub json_mode: bool,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Whether requests should ask for JSON output. Queried once when the
    /// invoker is built; a runtime rejection still switches it off.
    fn supports_json_mode(&self) -> bool {
        true
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, call: &ModelCall<'_>) -> Result<String, BackendError>;

    async fn stream(&self, call: &ModelCall<'_>) -> Result<TextStream, BackendError> {
        let text = self.complete(call).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    /// Computed per model from the prompt size when unset.
    pub max_tokens: Option<u32>,
}

impl CallOptions {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, temperature: f64) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature,
            max_tokens: None,
        }
    }

    fn max_tokens_for(&self, model: &str) -> u32 {
        self.max_tokens.unwrap_or_else(|| {
            let prompt_tokens = estimate_tokens(&self.system) + estimate_tokens(&self.prompt);
            max_output_tokens(model, prompt_tokens)
        })
    }
}

pub struct ProviderStream {
    pub fragments: TextStream,
    pub provider: ProviderKind,
    pub role: ProviderRole,
    pub model_used: String,
}

pub struct ProviderInvoker {
    provider: ProviderKind,
    role: ProviderRole,
    backend: Option<Arc<dyn CompletionBackend>>,
    unavailable_reason: String,
    candidates: Vec<String>,
    timeout: Duration,
    json_mode: AtomicBool,
}

impl ProviderInvoker {
    pub fn new(
        role: ProviderRole,
        backend: Arc<dyn CompletionBackend>,
        candidates: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider: backend.provider(),
            role,
            json_mode: AtomicBool::new(backend.supports_json_mode()),
            backend: Some(backend),
            unavailable_reason: String::new(),
            candidates,
            timeout,
        }
    }

    /// An invoker with no usable credential. Every call fails with a
    /// configuration error carrying `reason`.
    pub fn unconfigured(provider: ProviderKind, role: ProviderRole, reason: impl Into<String>) -> Self {
        Self {
            provider,
            role,
            backend: None,
            unavailable_reason: reason.into(),
            candidates: Vec::new(),
            timeout: Duration::from_secs(0),
            json_mode: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn json_mode_enabled(&self) -> bool {
        self.json_mode.load(Ordering::Relaxed)
    }

    fn backend(&self) -> Result<&Arc<dyn CompletionBackend>, AnalysisError> {
        self.backend
            .as_ref()
            .ok_or_else(|| AnalysisError::configuration(self.provider, &self.unavailable_reason))
    }

    fn map_error(&self, err: BackendError) -> AnalysisError {
        match err {
            BackendError::Unauthorized(message) => {
                AnalysisError::configuration(self.provider, message)
            }
            other => AnalysisError::provider_call(self.provider, other.to_string()),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(BackendError::Timeout(self.timeout)))
    }

    /// Walk the model candidates, stopping at the first result that is not
    /// a missing-model error. `call` runs one attempt for one model.
    async fn with_candidates<'a, T, F, Fut>(&'a self, mut call: F) -> Result<(T, &'a str), AnalysisError>
    where
        F: FnMut(&'a str, bool) -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let mut last_error = None;
        for (attempt, model) in self.candidates.iter().enumerate() {
            if attempt > 0 {
                info!(provider = %self.provider, model = %model, "trying next model candidate");
            }
            let json_mode = self.json_mode_enabled();
            let result = match self.bounded(call(model, json_mode)).await {
                Err(BackendError::UnsupportedConfig(reason)) if json_mode => {
                    warn!(
                        provider = %self.provider,
                        model = %model,
                        "JSON mode rejected ({reason}), retrying without it"
                    );
                    self.json_mode.store(false, Ordering::Relaxed);
                    self.bounded(call(model, false)).await
                }
                other => other,
            };
            match result {
                Ok(value) => return Ok((value, model.as_str())),
                Err(err) if err.is_model_not_found() => {
                    warn!(provider = %self.provider, model = %model, "model unavailable: {err}");
                    last_error = Some(err);
                }
                Err(err) => return Err(self.map_error(err)),
            }
        }
        Err(self.map_error(last_error.unwrap_or_else(|| {
            BackendError::Request("no model candidates configured".to_string())
        })))
    }

    pub async fn invoke(&self, options: &CallOptions) -> Result<RawProviderResponse, AnalysisError> {
        let backend = self.backend()?;
        debug!(provider = %self.provider, role = ?self.role, "invoking provider");

        let (text, model) = self
            .with_candidates(|model, json_mode| {
                let backend = Arc::clone(backend);
                let options = options.clone();
                let model = model.to_string();
                async move {
                    let call = ModelCall {
                        model: &model,
                        system: &options.system,
                        prompt: &options.prompt,
                        temperature: options.temperature,
                        max_tokens: options.max_tokens_for(&model),
                        json_mode,
                    };
                    backend.complete(&call).await
                }
            })
            .await?;

        if text.trim().is_empty() {
            return Err(self.map_error(BackendError::EmptyResponse));
        }
        info!(
            provider = %self.provider,
            model = %model,
            chars = text.chars().count(),
            "provider responded"
        );
        Ok(RawProviderResponse {
            text,
            provider: self.provider,
            role: self.role,
            model_used: model.to_string(),
        })
    }

    /// Open a fragment stream. Backends that cannot stream produce a single
    /// fragment holding the whole completion.
    pub async fn invoke_stream(&self, options: &CallOptions) -> Result<ProviderStream, AnalysisError> {
        let backend = self.backend()?;
        let native = backend.supports_streaming();
        debug!(provider = %self.provider, native, "opening stream");

        let (fragments, model) = self
            .with_candidates(|model, json_mode| {
                let backend = Arc::clone(backend);
                let options = options.clone();
                let model = model.to_string();
                async move {
                    let call = ModelCall {
                        model: &model,
                        system: &options.system,
                        prompt: &options.prompt,
                        temperature: options.temperature,
                        max_tokens: options.max_tokens_for(&model),
                        json_mode,
                    };
                    if native {
                        backend.stream(&call).await
                    } else {
                        let text = backend.complete(&call).await?;
                        Ok(stream::once(async move { Ok(text) }).boxed())
                    }
                }
            })
            .await?;

        Ok(ProviderStream {
            fragments,
            provider: self.provider,
            role: self.role,
            model_used: model.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend for orchestrator and invoker tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub model: String,
        pub json_mode: bool,
    }

    pub struct ScriptedBackend {
        provider: ProviderKind,
        script: Mutex<VecDeque<Result<String, BackendError>>>,
        fragments: Option<Vec<String>>,
        json_capable: bool,
        delay: Option<Duration>,
        calls: Mutex<Vec<RecordedCall>>,
        count: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn new(provider: ProviderKind, script: Vec<Result<String, BackendError>>) -> Self {
            Self {
                provider,
                script: Mutex::new(script.into()),
                fragments: None,
                json_capable: true,
                delay: None,
                calls: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            }
        }

        pub fn replying(provider: ProviderKind, text: &str) -> Self {
            Self::new(provider, vec![Ok(text.to_string())])
        }

        pub fn failing(provider: ProviderKind, err: BackendError) -> Self {
            Self::new(provider, vec![Err(err)])
        }

        pub fn streaming(provider: ProviderKind, fragments: &[&str]) -> Self {
            let mut backend = Self::new(provider, Vec::new());
            backend.fragments = Some(fragments.iter().map(|f| f.to_string()).collect());
            backend
        }

        /// Sleep this long before answering each call.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn without_json_mode(mut self) -> Self {
            self.json_capable = false;
            self
        }

        pub fn call_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &ModelCall<'_>) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(RecordedCall {
                model: call.model.to_string(),
                json_mode: call.json_mode,
            });
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn provider(&self) -> ProviderKind {
            self.provider
        }

        fn supports_json_mode(&self) -> bool {
            self.json_capable
        }

        async fn complete(&self, call: &ModelCall<'_>) -> Result<String, BackendError> {
            self.record(call);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            // The last scripted reply repeats once the script runs out.
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script
                    .front()
                    .cloned()
                    .unwrap_or_else(|| Err(BackendError::Request("script exhausted".into())))
            }
        }

        async fn stream(&self, call: &ModelCall<'_>) -> Result<TextStream, BackendError> {
            match &self.fragments {
                Some(fragments) => {
                    self.record(call);
                    let items: Vec<Result<String, BackendError>> =
                        fragments.iter().cloned().map(Ok).collect();
                    Ok(stream::iter(items).boxed())
                }
                None => {
                    let text = self.complete(call).await?;
                    Ok(stream::once(async move { Ok(text) }).boxed())
                }
            }
        }
    }

    pub fn invoker(role: ProviderRole, backend: Arc<ScriptedBackend>) -> ProviderInvoker {
        invoker_with_timeout(role, backend, Duration::from_secs(5))
    }

    pub fn invoker_with_timeout(
        role: ProviderRole,
        backend: Arc<ScriptedBackend>,
        timeout: Duration,
    ) -> ProviderInvoker {
        let candidates = match backend.provider() {
            ProviderKind::OpenAi => vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()],
            ProviderKind::Gemini => vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.0-flash".to_string(),
                "gemini-1.5-flash".to_string(),
            ],
        };
        ProviderInvoker::new(role, backend, candidates, timeout)
    }
}
