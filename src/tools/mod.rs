pub mod gemini;
pub mod llm;
pub mod openai;
pub mod sse;

pub use llm::{
    BackendError, CallOptions, CompletionBackend, ModelCall, ProviderInvoker, ProviderStream,
    TextStream,
};

use std::sync::Arc;
use std::time::Duration;

use crate::config::{resolve_api_key, Settings};
use crate::models::{ProviderKind, ProviderRole};

/// Build the invoker for `kind`, resolving its credential through `lookup`
/// (the process environment in production). A missing or malformed key
/// yields an unconfigured invoker rather than an error.
pub fn build_invoker(
    kind: ProviderKind,
    role: ProviderRole,
    settings: &Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> ProviderInvoker {
    let api_key = match resolve_api_key(kind, settings, lookup) {
        Ok(key) => key,
        Err(reason) => return ProviderInvoker::unconfigured(kind, role, reason),
    };

    let timeout = Duration::from_secs(settings.analysis.request_timeout_secs.max(1));
    let base_url = settings.provider(kind).base_url.as_deref();
    let backend: Arc<dyn CompletionBackend> = match kind {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiBackend::new(api_key, base_url, timeout)),
        ProviderKind::Gemini => Arc::new(gemini::GeminiBackend::new(api_key, base_url, timeout)),
    };
    ProviderInvoker::new(role, backend, settings.model_candidates(kind), timeout)
}
