use serde_json::{json, Value};
use tracing::info;

use crate::config::ApiKeyStatus;
use crate::error::AnalysisError;
use crate::models::{AnalysisRequest, ProviderKind};
use crate::report::{normalize_for, Degradation, JsonMap, StructuredReport};

#[derive(Debug, Clone)]
pub enum FallbackReason {
    /// No provider had a usable credential.
    MissingCredentials,
    /// Every configured provider was tried and failed.
    ProvidersFailed(Vec<AnalysisError>),
}

fn credential_hint(kind: ProviderKind) -> String {
    match kind {
        ProviderKind::OpenAi => format!(
            "Set {} (starts with \"sk-\", at least 20 characters) in the environment \
             or under [openai] in target-analyzer.toml.",
            kind.env_key()
        ),
        ProviderKind::Gemini => format!(
            "Set {} (at least 20 characters) in the environment or under [gemini] \
             in target-analyzer.toml.",
            kind.env_key()
        ),
    }
}

fn remediation(status: &ApiKeyStatus, reason: &FallbackReason) -> Vec<Value> {
    let mut steps: Vec<Value> = [ProviderKind::OpenAi, ProviderKind::Gemini]
        .into_iter()
        .filter(|kind| !status.is_configured(*kind))
        .map(|kind| json!(credential_hint(kind)))
        .collect();
    if let FallbackReason::ProvidersFailed(errors) = reason {
        for err in errors {
            steps.push(json!(match err {
                AnalysisError::Configuration { provider, .. } => format!(
                    "{} rejected its credential; check {}.",
                    provider.label(),
                    provider.env_key()
                ),
                other => format!("Retry later: {other}."),
            }));
        }
    }
    steps
}

/// Deterministic report produced without any provider. It explains what is
/// missing or what failed and how to fix it.
pub fn basic_fallback(
    request: &AnalysisRequest,
    status: &ApiKeyStatus,
    reason: FallbackReason,
) -> StructuredReport {
    let summary = match &reason {
        FallbackReason::MissingCredentials => format!(
            "No AI provider is configured, so only a basic {} analysis of \"{}\" is available. {}",
            request.target_type, request.target_keyword, status.message
        ),
        FallbackReason::ProvidersFailed(errors) => format!(
            "AI analysis of \"{}\" could not be completed ({} provider call(s) failed), \
             so a basic {} analysis is shown instead.",
            request.target_keyword,
            errors.len(),
            request.target_type
        ),
    };
    info!(
        keyword = %request.target_keyword,
        target_type = %request.target_type,
        "producing basic fallback report"
    );

    let points = vec![
        json!(format!("Key characteristics of {}", request.target_keyword)),
        json!(format!("A {} perspective on the target", request.target_type)),
    ];
    let mut raw = JsonMap::new();
    raw.insert("target_keyword".to_string(), json!(request.target_keyword));
    raw.insert("executive_summary".to_string(), json!(summary));
    raw.insert("key_points".to_string(), Value::Array(points));
    raw.insert(
        "recommendations".to_string(),
        Value::Array(remediation(status, &reason)),
    );
    if let Some(context) = &request.additional_context {
        raw.insert(
            "analysis_overview".to_string(),
            json!({"additional_context": context}),
        );
    }

    let mut report = normalize_for(raw, request.target_type);
    let metadata = report.metadata_mut();
    metadata.degradation = Some(Degradation::BasicFallback);
    metadata.api_key_status = Some(status.clone());
    metadata
        .flags
        .insert("provider_configured".to_string(), json!(status.any_configured()));
    if let FallbackReason::ProvidersFailed(errors) = &reason {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        metadata
            .flags
            .insert("provider_errors".to_string(), json!(messages));
    }
    report
}
