use std::time::Instant;

use tracing::{info, instrument, warn};

use super::fallback::{basic_fallback, FallbackReason};
use super::merge::merge_reports;
use super::prompt::{build_prompt, SYSTEM_PROMPT};
use crate::config::{ApiKeyStatus, AnalysisSettings, Settings};
use crate::error::AnalysisError;
use crate::models::{AnalysisRequest, ProviderKind, ProviderRole};
use crate::parsing::parse_with_outcome;
use crate::progress::ProgressTracker;
use crate::report::{normalize_for, Degradation, StructuredReport};
use crate::tools::{build_invoker, CallOptions, ProviderInvoker};

pub struct Analyzer {
    primary: ProviderInvoker,
    secondary: ProviderInvoker,
    temperature: f64,
    max_context_chars: usize,
}

pub(super) fn step(progress: Option<&ProgressTracker>, percent: i32, message: impl Into<String>) {
    if let Some(tracker) = progress {
        tracker.update(percent, message);
    }
}

impl Analyzer {
    pub fn new(
        primary: ProviderInvoker,
        secondary: ProviderInvoker,
        settings: &AnalysisSettings,
    ) -> Self {
        Self {
            primary,
            secondary,
            temperature: settings.temperature,
            max_context_chars: settings.max_context_chars,
        }
    }

    /// OpenAI as primary, Gemini as secondary, credentials from the process
    /// environment or the settings file.
    pub fn from_settings(settings: &Settings) -> Self {
        let env = |key: &str| std::env::var(key).ok();
        Self::new(
            build_invoker(ProviderKind::OpenAi, ProviderRole::Primary, settings, env),
            build_invoker(ProviderKind::Gemini, ProviderRole::Secondary, settings, env),
            &settings.analysis,
        )
    }

    pub fn api_key_status(&self) -> ApiKeyStatus {
        let configured = |kind: ProviderKind| {
            [&self.primary, &self.secondary]
                .iter()
                .any(|invoker| invoker.provider() == kind && invoker.is_configured())
        };
        ApiKeyStatus::new(
            configured(ProviderKind::OpenAi),
            configured(ProviderKind::Gemini),
        )
    }

    pub(super) fn temperature(&self) -> f64 {
        self.temperature
    }

    pub(super) fn max_context_chars(&self) -> usize {
        self.max_context_chars
    }

    pub(super) fn chain(&self) -> Vec<&ProviderInvoker> {
        [&self.primary, &self.secondary]
            .into_iter()
            .filter(|invoker| invoker.is_configured())
            .collect()
    }

    pub(super) fn options(&self, request: &AnalysisRequest) -> CallOptions {
        CallOptions::new(
            SYSTEM_PROMPT,
            build_prompt(request, self.max_context_chars),
            self.temperature,
        )
    }

    pub(super) fn degradation_for(invoker: &ProviderInvoker, position: usize) -> Degradation {
        match (position, invoker.role()) {
            (0, ProviderRole::Primary) => Degradation::PrimaryOnly,
            (0, ProviderRole::Secondary) => Degradation::SecondaryOnly,
            _ => Degradation::Failover,
        }
    }

    pub(super) fn wants_augmentation(&self, request: &AnalysisRequest, invoker: &ProviderInvoker) -> bool {
        request.use_secondary_provider
            && invoker.role() == ProviderRole::Primary
            && self.secondary.is_configured()
    }

    pub(super) fn fallback(&self, request: &AnalysisRequest, errors: Vec<AnalysisError>) -> StructuredReport {
        let reason = if errors.is_empty() {
            FallbackReason::MissingCredentials
        } else {
            FallbackReason::ProvidersFailed(errors)
        };
        basic_fallback(request, &self.api_key_status(), reason)
    }

    pub(super) fn finalize(
        &self,
        text: &str,
        provider: ProviderKind,
        model: &str,
        request: &AnalysisRequest,
    ) -> StructuredReport {
        let outcome = parse_with_outcome(text);
        let stage = outcome.stage;
        let partial = outcome.is_partial();
        if !stage.is_structural() {
            warn!(%provider, ?stage, "response was not valid JSON");
        }

        let mut report = normalize_for(outcome.value, request.target_type);
        report.backfill_keyword(&request.target_keyword);
        let metadata = report.metadata_mut();
        metadata.record_provider(provider, model);
        metadata.parse_stage = Some(stage);
        metadata.is_partial |= partial;
        report
    }

    /// Ask the secondary provider and merge its report into `primary`. Any
    /// failure keeps `primary` and records why under `merge_error`.
    pub(super) async fn augment(
        &self,
        mut primary: StructuredReport,
        request: &AnalysisRequest,
        options: &CallOptions,
    ) -> StructuredReport {
        let raw = match self.secondary.invoke(options).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("secondary augmentation failed: {err}");
                primary.metadata_mut().merge_error = Some(err.to_string());
                return primary;
            }
        };
        let secondary = self.finalize(&raw.text, raw.provider, &raw.model_used, request);
        match merge_reports(primary, secondary, raw.provider) {
            Ok(mut merged) => {
                merged.metadata_mut().degradation = Some(Degradation::Merged);
                merged
            }
            Err((mut primary, mismatch)) => {
                warn!("merge skipped: {mismatch}");
                primary.metadata_mut().merge_error = Some(mismatch.to_string());
                primary
            }
        }
    }

    /// Produce a report for `request`.
    ///
    /// Fails only with a configuration error from the sole configured
    /// provider. Every other failure degrades to the next provider or to
    /// the basic report.
    #[instrument(
        skip(self, request, progress),
        fields(keyword = %request.target_keyword, target_type = %request.target_type)
    )]
    pub async fn perform_analysis(
        &self,
        request: &AnalysisRequest,
        progress: Option<&ProgressTracker>,
    ) -> Result<StructuredReport, AnalysisError> {
        let start_time = Instant::now();
        info!("Starting analysis");
        step(progress, 5, "Preparing analysis");

        let chain = self.chain();
        if chain.is_empty() {
            info!("no provider configured, using basic analysis");
            let report = self.fallback(request, Vec::new());
            step(progress, 100, "Analysis complete");
            return Ok(report);
        }

        let options = self.options(request);
        let mut errors = Vec::new();
        for (position, invoker) in chain.iter().enumerate() {
            let percent = if position == 0 { 20 } else { 50 };
            step(
                progress,
                percent,
                format!("Requesting analysis from {}", invoker.provider().label()),
            );

            match invoker.invoke(&options).await {
                Ok(raw) => {
                    step(progress, 70, "Parsing response");
                    let mut report =
                        self.finalize(&raw.text, raw.provider, &raw.model_used, request);
                    report.metadata_mut().degradation =
                        Some(Self::degradation_for(invoker, position));
                    if self.wants_augmentation(request, invoker) {
                        step(progress, 80, "Augmenting with secondary provider");
                        report = self.augment(report, request, &options).await;
                    }
                    step(progress, 100, "Analysis complete");
                    info!("Analysis completed in {:?}", start_time.elapsed());
                    return Ok(report);
                }
                Err(err) if err.is_configuration() && chain.len() == 1 => {
                    warn!("only configured provider rejected its credential: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!(provider = %invoker.provider(), "provider failed: {err}");
                    errors.push(err);
                }
            }
        }

        step(progress, 90, "Providers unavailable, building basic analysis");
        let report = self.fallback(request, errors);
        step(progress, 100, "Analysis complete");
        info!("Analysis degraded to basic report in {:?}", start_time.elapsed());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::tools::llm::testing::{invoker, invoker_with_timeout, ScriptedBackend};
    use crate::tools::BackendError;

    const PRIMARY_JSON: &str = r#"{"target_keyword": "electric cars", "executive_summary": "Demand is rising.", "key_findings": {"primary_insights": ["charging"]}}"#;
    const SECONDARY_JSON: &str = r#"```json
{"executive_summary": "Prices are falling.", "key_findings": {"primary_insights": ["charging", "price"]}}
```"#;

    fn openai(backend: &Arc<ScriptedBackend>) -> ProviderInvoker {
        invoker(ProviderRole::Primary, Arc::clone(backend))
    }

    fn gemini(backend: &Arc<ScriptedBackend>) -> ProviderInvoker {
        invoker(ProviderRole::Secondary, Arc::clone(backend))
    }

    fn absent(kind: ProviderKind, role: ProviderRole) -> ProviderInvoker {
        ProviderInvoker::unconfigured(kind, role, format!("{} is not set", kind.env_key()))
    }

    fn analyzer(primary: ProviderInvoker, secondary: ProviderInvoker) -> Analyzer {
        Analyzer::new(primary, secondary, &AnalysisSettings::default())
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("electric cars", crate::models::TargetType::Keyword)
    }

    #[tokio::test]
    async fn test_no_credentials_uses_basic_report() {
        let analyzer = analyzer(
            absent(ProviderKind::OpenAi, ProviderRole::Primary),
            absent(ProviderKind::Gemini, ProviderRole::Secondary),
        );
        let request = AnalysisRequest::new("X", crate::models::TargetType::Keyword);
        let report = analyzer.perform_analysis(&request, None).await.unwrap();

        let value = report.to_value();
        assert_eq!(value["target_keyword"], json!("X"));
        assert_eq!(value["target_type"], json!("keyword"));
        assert_eq!(value["metadata"]["provider_configured"], json!(false));
        assert_eq!(value["metadata"]["degradation"], json!("basic_fallback"));
    }

    #[tokio::test]
    async fn test_model_candidates_tried_in_order_until_success() {
        let not_found = |model: &str| BackendError::ModelNotFound {
            model: model.to_string(),
            message: "404".to_string(),
        };
        let backend = Arc::new(ScriptedBackend::new(
            ProviderKind::OpenAi,
            vec![
                Err(not_found("gpt-4.1-mini")),
                Err(not_found("gpt-4o-mini")),
                Ok(PRIMARY_JSON.to_string()),
            ],
        ));
        let candidates = vec![
            "gpt-4.1-mini".to_string(),
            "gpt-4o-mini".to_string(),
            "gpt-4o".to_string(),
        ];
        let primary = ProviderInvoker::new(
            ProviderRole::Primary,
            Arc::clone(&backend) as Arc<dyn crate::tools::CompletionBackend>,
            candidates,
            Duration::from_secs(5),
        );
        let analyzer = analyzer(primary, absent(ProviderKind::Gemini, ProviderRole::Secondary));

        let report = analyzer.perform_analysis(&request(), None).await.unwrap();
        assert_eq!(backend.call_count(), 3);
        assert_eq!(report.executive_summary(), "Demand is rising.");
        assert_eq!(report.metadata().models_used, vec!["gpt-4o"]);
        assert_eq!(report.metadata().degradation, Some(Degradation::PrimaryOnly));
    }

    #[tokio::test]
    async fn test_fails_over_to_secondary() {
        let primary = Arc::new(ScriptedBackend::failing(
            ProviderKind::OpenAi,
            BackendError::Timeout(Duration::from_secs(60)),
        ));
        let secondary = Arc::new(ScriptedBackend::replying(ProviderKind::Gemini, SECONDARY_JSON));
        let analyzer = analyzer(openai(&primary), gemini(&secondary));

        let report = analyzer.perform_analysis(&request(), None).await.unwrap();
        assert_eq!(report.executive_summary(), "Prices are falling.");
        assert_eq!(report.target_keyword(), "electric cars");
        assert_eq!(report.metadata().degradation, Some(Degradation::Failover));
        assert_eq!(report.metadata().providers, vec![ProviderKind::Gemini]);
    }

    #[tokio::test]
    async fn test_slow_primary_times_out_and_fails_over() {
        let primary = Arc::new(
            ScriptedBackend::replying(ProviderKind::OpenAi, PRIMARY_JSON)
                .with_delay(Duration::from_secs(2)),
        );
        let secondary = Arc::new(ScriptedBackend::replying(ProviderKind::Gemini, SECONDARY_JSON));
        let primary_invoker = invoker_with_timeout(
            ProviderRole::Primary,
            Arc::clone(&primary),
            Duration::from_millis(20),
        );
        let analyzer = analyzer(primary_invoker, gemini(&secondary));

        let started = std::time::Instant::now();
        let report = analyzer.perform_analysis(&request(), None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
        assert_eq!(report.executive_summary(), "Prices are falling.");
        assert_eq!(report.metadata().degradation, Some(Degradation::Failover));
    }

    #[tokio::test]
    async fn test_configuration_error_fails_over_when_alternate_exists() {
        let primary = Arc::new(ScriptedBackend::failing(
            ProviderKind::OpenAi,
            BackendError::Unauthorized("HTTP 401".into()),
        ));
        let secondary = Arc::new(ScriptedBackend::replying(ProviderKind::Gemini, SECONDARY_JSON));
        let analyzer = analyzer(openai(&primary), gemini(&secondary));

        let report = analyzer.perform_analysis(&request(), None).await.unwrap();
        assert_eq!(report.metadata().degradation, Some(Degradation::Failover));
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_configuration_error_without_alternate_is_raised() {
        let primary = Arc::new(ScriptedBackend::failing(
            ProviderKind::OpenAi,
            BackendError::Unauthorized("HTTP 401".into()),
        ));
        let analyzer = analyzer(
            openai(&primary),
            absent(ProviderKind::Gemini, ProviderRole::Secondary),
        );
        let err = analyzer.perform_analysis(&request(), None).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_merges_when_secondary_requested() {
        let primary = Arc::new(ScriptedBackend::replying(ProviderKind::OpenAi, PRIMARY_JSON));
        let secondary = Arc::new(ScriptedBackend::replying(ProviderKind::Gemini, SECONDARY_JSON));
        let analyzer = analyzer(openai(&primary), gemini(&secondary));
        let mut request = request();
        request.use_secondary_provider = true;

        let report = analyzer.perform_analysis(&request, None).await.unwrap();
        assert_eq!(
            report.executive_summary(),
            "Demand is rising.\n\n[Gemini] Prices are falling."
        );
        assert_eq!(report.metadata().degradation, Some(Degradation::Merged));
        assert_eq!(
            report.metadata().providers,
            vec![ProviderKind::OpenAi, ProviderKind::Gemini]
        );
        assert_eq!(
            report.to_value()["key_findings"]["primary_insights"],
            json!(["charging", "price"])
        );
    }

    #[tokio::test]
    async fn test_secondary_not_called_unless_requested() {
        let primary = Arc::new(ScriptedBackend::replying(ProviderKind::OpenAi, PRIMARY_JSON));
        let secondary = Arc::new(ScriptedBackend::replying(ProviderKind::Gemini, SECONDARY_JSON));
        let analyzer = analyzer(openai(&primary), gemini(&secondary));

        analyzer.perform_analysis(&request(), None).await.unwrap();
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_augmentation_keeps_primary() {
        let primary = Arc::new(ScriptedBackend::replying(ProviderKind::OpenAi, PRIMARY_JSON));
        let secondary = Arc::new(ScriptedBackend::failing(
            ProviderKind::Gemini,
            BackendError::RateLimited("quota".into()),
        ));
        let analyzer = analyzer(openai(&primary), gemini(&secondary));
        let mut request = request();
        request.use_secondary_provider = true;

        let report = analyzer.perform_analysis(&request, None).await.unwrap();
        assert_eq!(report.executive_summary(), "Demand is rising.");
        assert_eq!(report.metadata().degradation, Some(Degradation::PrimaryOnly));
        assert!(report.metadata().merge_error.as_deref().unwrap().contains("quota"));
    }

    #[tokio::test]
    async fn test_both_failing_degrades_to_basic_report() {
        let primary = Arc::new(ScriptedBackend::failing(
            ProviderKind::OpenAi,
            BackendError::Request("boom".into()),
        ));
        let secondary = Arc::new(ScriptedBackend::failing(
            ProviderKind::Gemini,
            BackendError::Request("bang".into()),
        ));
        let analyzer = analyzer(openai(&primary), gemini(&secondary));

        let report = analyzer.perform_analysis(&request(), None).await.unwrap();
        assert_eq!(report.metadata().degradation, Some(Degradation::BasicFallback));
        assert_eq!(
            report.to_value()["metadata"]["provider_errors"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_every_provider_combination_returns_a_result() {
        for primary_present in [true, false] {
            for secondary_present in [true, false] {
                for primary_succeeds in [true, false] {
                    let primary = if primary_present {
                        let backend = if primary_succeeds {
                            ScriptedBackend::replying(ProviderKind::OpenAi, PRIMARY_JSON)
                        } else {
                            ScriptedBackend::failing(
                                ProviderKind::OpenAi,
                                BackendError::Request("down".into()),
                            )
                        };
                        openai(&Arc::new(backend))
                    } else {
                        absent(ProviderKind::OpenAi, ProviderRole::Primary)
                    };
                    let secondary = if secondary_present {
                        gemini(&Arc::new(ScriptedBackend::replying(
                            ProviderKind::Gemini,
                            SECONDARY_JSON,
                        )))
                    } else {
                        absent(ProviderKind::Gemini, ProviderRole::Secondary)
                    };

                    let result = analyzer(primary, secondary)
                        .perform_analysis(&request(), None)
                        .await;
                    let report = result.unwrap_or_else(|e| {
                        panic!(
                            "primary={primary_present} secondary={secondary_present} \
                             succeeds={primary_succeeds}: {e}"
                        )
                    });
                    assert_eq!(report.target_type(), "keyword");
                    assert!(!report.executive_summary().is_empty());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unparseable_reply_still_produces_report() {
        let primary = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            "Sorry, I cannot produce JSON today.",
        ));
        let analyzer = analyzer(
            openai(&primary),
            absent(ProviderKind::Gemini, ProviderRole::Secondary),
        );
        let report = analyzer.perform_analysis(&request(), None).await.unwrap();
        let value = report.to_value();
        assert_eq!(value["target_keyword"], json!("electric cars"));
        assert_eq!(value["metadata"]["parse_error"], json!("json_parse_failed"));
        assert_eq!(value["metadata"]["parse_stage"], json!("minimal"));
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let primary = Arc::new(ScriptedBackend::replying(ProviderKind::OpenAi, PRIMARY_JSON));
        let analyzer = analyzer(
            openai(&primary),
            absent(ProviderKind::Gemini, ProviderRole::Secondary),
        );
        let tracker = ProgressTracker::new();
        analyzer
            .perform_analysis(&request(), Some(&tracker))
            .await
            .unwrap();
        let status = tracker.status();
        assert_eq!(status.progress, 100);
        let percents: Vec<u8> = status.steps.iter().map(|s| s.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }
}
