//! Side analyses never fail. When no provider returns usable JSON a neutral
//! placeholder is returned with `metadata.is_fallback` set.

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use super::analyzer::{step, Analyzer};
use crate::error::AnalysisError;
use crate::models::{
    AnalysisDepth, AnalysisRequest, CompareRequest, InsightRequest, ProviderKind,
    RecommendationRequest, RecommendationType, TargetType,
};
use crate::parsing::{parse_with_outcome, RepairStage};
use crate::progress::ProgressTracker;
use crate::tokens::{optimize_additional_context, optimize_prompt};
use crate::tools::CallOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightKind {
    Sentiment,
    Context,
    Tone,
}

impl InsightKind {
    pub const ALL: [InsightKind; 3] = [Self::Sentiment, Self::Context, Self::Tone];

    pub fn section(&self) -> &'static str {
        match self {
            Self::Sentiment => "sentiment",
            Self::Context => "context",
            Self::Tone => "tone",
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            Self::Sentiment => {
                "You are an expert sentiment analyst who reads public emotion around a topic. \
                 You always answer with a single JSON object and nothing else."
            }
            Self::Context => {
                "You are an expert context analyst covering social, cultural and temporal context. \
                 You always answer with a single JSON object and nothing else."
            }
            Self::Tone => {
                "You are an expert tone analyst who studies how media and brands talk about a topic. \
                 You always answer with a single JSON object and nothing else."
            }
        }
    }

    fn task(&self) -> &'static str {
        match self {
            Self::Sentiment => "Analyze public sentiment toward this target.",
            Self::Context => "Analyze the social, cultural and temporal context of this target.",
            Self::Tone => "Analyze the tone of media coverage and conversation about this target.",
        }
    }

    fn schema(&self) -> &'static str {
        match self {
            Self::Sentiment => {
                r#"{
  "sentiment": {
    "overall": "positive|negative|neutral",
    "score": 72,
    "distribution": {"positive": 65, "neutral": 25, "negative": 10},
    "trend": "improving|worsening|stable",
    "key_emotional_drivers": ["driver 1", "driver 2"],
    "emotional_intensity": "high|medium|low",
    "sentiment_details": {"positive_aspects": ["..."], "negative_aspects": ["..."], "neutral_aspects": ["..."]}
  }
}"#
            }
            Self::Context => {
                r#"{
  "context": {
    "social_relevance": "high|medium|low",
    "current_issues": ["issue 1", "issue 2"],
    "cultural_context": "...",
    "temporal_factors": "...",
    "regional_context": "...",
    "industry_context": "...",
    "related_movements": ["movement 1", "movement 2"]
  }
}"#
            }
            Self::Tone => {
                r#"{
  "tone": {
    "professional": 0.85,
    "positive": 0.72,
    "objective": 0.68,
    "formal": 0.75,
    "technical": 0.80,
    "accessible": 0.65,
    "tone_description": "...",
    "primary_tone": "...",
    "tone_consistency": "high|medium|low"
  }
}"#
            }
        }
    }

    /// Neutral reading used when no provider answers.
    fn basic(&self) -> Value {
        match self {
            Self::Sentiment => json!({
                "overall": "neutral",
                "score": 50,
                "distribution": {"positive": 33, "neutral": 34, "negative": 33},
                "trend": "stable",
                "key_emotional_drivers": [NO_PROVIDER_NOTE],
            }),
            Self::Context => json!({
                "social_relevance": "medium",
                "current_issues": [NO_PROVIDER_NOTE],
                "cultural_context": "basic analysis mode",
                "temporal_factors": Utc::now().format("%B %Y").to_string(),
            }),
            Self::Tone => json!({
                "professional": 0.5,
                "positive": 0.5,
                "objective": 0.5,
                "formal": 0.5,
            }),
        }
    }
}

const NO_PROVIDER_NOTE: &str = "Configure an AI provider key for a detailed analysis.";

const RECOMMENDATION_SYSTEM_PROMPT: &str = "You are an expert keyword researcher and SEO \
specialist. You recommend keywords by semantic similarity, co-occurrence and market trends, \
and you always answer with a single JSON object and nothing else.";

fn recommendation_focus(kind: RecommendationType) -> &'static str {
    match kind {
        RecommendationType::All => "related keywords of every kind",
        RecommendationType::Semantic => "semantically similar keywords only",
        RecommendationType::CoOccurring => "keywords that frequently co-occur with the target only",
        RecommendationType::Hierarchical => "broader and narrower keywords only",
        RecommendationType::Trending => "related keywords that are trending now only",
        RecommendationType::Alternative => "keywords that could replace the target only",
    }
}

fn recommendation_schema(kind: RecommendationType) -> &'static str {
    match kind {
        RecommendationType::All => {
            r#"{
  "related_keywords": {
    "semantic_similar": [{"keyword": "...", "relevance": 0.92, "description": "..."}],
    "co_occurring": [{"keyword": "...", "frequency": 0.75, "description": "..."}],
    "hierarchical": {
      "broader": [{"keyword": "...", "description": "..."}],
      "narrower": [{"keyword": "...", "description": "..."}]
    }
  },
  "trending_related": [{"keyword": "...", "trend": "rising", "growth_rate": "high", "description": "..."}],
  "alternative_keywords": [{"keyword": "...", "similarity": 0.85, "use_case": "..."}],
  "long_tail_keywords": [{"keyword": "...", "search_intent": "...", "competition": "low"}],
  "recommendation_summary": "..."
}"#
        }
        RecommendationType::Semantic => {
            r#"{"semantic_similar": [{"keyword": "...", "relevance": 0.92, "description": "..."}]}"#
        }
        RecommendationType::CoOccurring => {
            r#"{"co_occurring": [{"keyword": "...", "frequency": 0.75, "description": "..."}]}"#
        }
        RecommendationType::Hierarchical => {
            r#"{"hierarchical": {"broader": [{"keyword": "...", "description": "..."}], "narrower": [{"keyword": "...", "description": "..."}]}}"#
        }
        RecommendationType::Trending => {
            r#"{"trending_related": [{"keyword": "...", "trend": "rising", "growth_rate": "high", "description": "..."}]}"#
        }
        RecommendationType::Alternative => {
            r#"{"alternative_keywords": [{"keyword": "...", "similarity": 0.85, "use_case": "..."}]}"#
        }
    }
}

fn respond_with(schema: &str) -> String {
    format!(
        "\nRespond with a single JSON object in exactly this shape, without markdown fences:\n{schema}\n"
    )
}

fn push_context(prompt: &mut String, context: Option<&str>, max_chars: usize) {
    if let Some(context) = optimize_additional_context(context, max_chars) {
        prompt.push_str(&format!("\nAdditional context:\n{context}\n"));
    }
}

pub fn insight_prompt(kind: InsightKind, request: &InsightRequest, max_context_chars: usize) -> String {
    let mut prompt = format!(
        "{}\n\nTarget: {}\nToday: {}\n",
        kind.task(),
        request.target_keyword,
        Utc::now().format("%Y-%m-%d")
    );
    push_context(&mut prompt, request.additional_context.as_deref(), max_context_chars);
    prompt.push_str(&respond_with(kind.schema()));
    optimize_prompt(&prompt, None)
}

pub fn recommendation_prompt(request: &RecommendationRequest, max_context_chars: usize) -> String {
    let mut prompt = format!(
        "Recommend {} for this keyword.\n\nKeyword: {}\nRecommendation type: {}\nMaximum results per list: {}\n",
        recommendation_focus(request.recommendation_type),
        request.target_keyword,
        request.recommendation_type,
        request.max_results
    );
    push_context(&mut prompt, request.additional_context.as_deref(), max_context_chars);
    prompt.push_str(&respond_with(recommendation_schema(request.recommendation_type)));
    optimize_prompt(&prompt, None)
}

fn basic_recommendations(request: &RecommendationRequest) -> Value {
    let similar: Vec<Value> = [0.8, 0.7]
        .iter()
        .enumerate()
        .take(request.max_results)
        .map(|(i, relevance)| {
            json!({
                "keyword": format!("{} related {}", request.target_keyword, i + 1),
                "relevance": relevance,
            })
        })
        .collect();
    json!({
        "related_keywords": {
            "semantic_similar": similar,
            "note": "Configure an AI provider key for detailed recommendations.",
        }
    })
}

/// Truncate every list of keyword entries to `max` items.
fn cap_keyword_lists(value: &mut Value, max: usize) {
    match value {
        Value::Array(items) => {
            let keyword_list = items
                .iter()
                .any(|item| item.get("keyword").is_some() || item.is_string());
            if keyword_list {
                items.truncate(max);
            }
            items.iter_mut().for_each(|item| cap_keyword_lists(item, max));
        }
        Value::Object(map) => map
            .values_mut()
            .for_each(|item| cap_keyword_lists(item, max)),
        _ => {}
    }
}

/// The reading under `key`, or the whole object when the model left out
/// the wrapper.
fn section_of(mut value: Value, key: &str) -> Value {
    if value.get(key).is_some_and(Value::is_object) {
        return value[key].take();
    }
    value
}

struct SideAnswer {
    value: Value,
    provider: ProviderKind,
    model_used: String,
    stage: RepairStage,
}

fn side_metadata(answer: Option<&SideAnswer>) -> Map<String, Value> {
    let mut metadata = Map::new();
    match answer {
        Some(answer) => {
            metadata.insert("provider".to_string(), json!(answer.provider));
            metadata.insert("model_used".to_string(), json!(answer.model_used));
            metadata.insert("parse_stage".to_string(), json!(answer.stage));
            metadata.insert("is_fallback".to_string(), json!(false));
        }
        None => {
            metadata.insert("is_fallback".to_string(), json!(true));
        }
    }
    metadata.insert("generated_at".to_string(), json!(Utc::now()));
    metadata
}

impl Analyzer {
    async fn ask_json(&self, options: &CallOptions) -> Option<SideAnswer> {
        for invoker in self.chain() {
            match invoker.invoke(options).await {
                Ok(raw) => {
                    let outcome = parse_with_outcome(&raw.text);
                    if outcome.stage.is_structural() {
                        return Some(SideAnswer {
                            value: Value::Object(outcome.value),
                            provider: raw.provider,
                            model_used: raw.model_used,
                            stage: outcome.stage,
                        });
                    }
                    warn!(provider = %raw.provider, stage = ?outcome.stage, "reply was not JSON");
                }
                Err(err) => warn!(provider = %invoker.provider(), "side analysis failed: {err}"),
            }
        }
        None
    }

    /// A sentiment, context or tone reading for one target.
    #[instrument(skip(self, kind, request), fields(keyword = %request.target_keyword, kind = kind.section()))]
    pub async fn insight(&self, kind: InsightKind, request: &InsightRequest) -> Value {
        let options = CallOptions::new(
            kind.system_prompt(),
            insight_prompt(kind, request, self.max_context_chars()),
            self.temperature(),
        );
        let answer = self.ask_json(&options).await;
        let section = match &answer {
            Some(answer) => section_of(answer.value.clone(), kind.section()),
            None => {
                info!("no provider answered, using basic reading");
                kind.basic()
            }
        };

        let mut result = Map::new();
        result.insert(kind.section().to_string(), section);
        result.insert("metadata".to_string(), Value::Object(side_metadata(answer.as_ref())));
        Value::Object(result)
    }

    #[instrument(
        skip(self, request),
        fields(keyword = %request.target_keyword, kind = %request.recommendation_type)
    )]
    pub async fn recommend_keywords(&self, request: &RecommendationRequest) -> Value {
        let options = CallOptions::new(
            RECOMMENDATION_SYSTEM_PROMPT,
            recommendation_prompt(request, self.max_context_chars()),
            self.temperature(),
        );
        let answer = self.ask_json(&options).await;
        let mut result = match &answer {
            Some(answer) => answer.value.clone(),
            None => basic_recommendations(request),
        };
        cap_keyword_lists(&mut result, request.max_results);

        let mut metadata = side_metadata(answer.as_ref());
        metadata.insert("recommendation_type".to_string(), json!(request.recommendation_type));
        metadata.insert("max_results".to_string(), json!(request.max_results));
        result["metadata"] = Value::Object(metadata);
        result
    }

    async fn compare_one(&self, keyword: &str, compare: &CompareRequest) -> Result<Value, AnalysisError> {
        let mut request = AnalysisRequest::new(keyword, TargetType::Keyword);
        request.use_secondary_provider = compare.use_secondary_provider;
        let mut result = self.perform_analysis(&request, None).await?.to_value();

        if compare.includes_sentiment() {
            let insight_request = InsightRequest {
                target_keyword: keyword.to_string(),
                additional_context: None,
            };
            let mut sentiment = self.insight(InsightKind::Sentiment, &insight_request).await;
            result["sentiment"] = sentiment["sentiment"].take();
        }
        Ok(result)
    }

    /// Analyze each keyword concurrently and collect the reports side by
    /// side. Fails only if one of the analyses fails.
    #[instrument(skip(self, request), fields(keywords = request.keywords.len()))]
    pub async fn compare(&self, request: &CompareRequest) -> Result<Value, AnalysisError> {
        let runs = request
            .keywords
            .iter()
            .map(|keyword| self.compare_one(keyword, request));
        let results = try_join_all(runs).await?;

        let comparison: Map<String, Value> = request.keywords.iter().cloned().zip(results).collect();
        info!("compared {} keywords", request.keywords.len());
        Ok(json!({
            "keywords": request.keywords,
            "comparison_results": comparison,
            "summary": format!("{} keywords compared", request.keywords.len()),
        }))
    }

    /// The main report with sentiment, context and tone readings and
    /// keyword recommendations attached.
    pub async fn comprehensive(
        &self,
        request: &AnalysisRequest,
        depth: AnalysisDepth,
        progress: Option<&ProgressTracker>,
    ) -> Result<Value, AnalysisError> {
        let mut result = self.perform_analysis(request, progress).await?.to_value();

        step(progress, 100, "Adding sentiment, context and tone");
        let insight_request = InsightRequest {
            target_keyword: request.target_keyword.clone(),
            additional_context: request.additional_context.clone(),
        };
        let (sentiment, context, tone) = tokio::join!(
            self.insight(InsightKind::Sentiment, &insight_request),
            self.insight(InsightKind::Context, &insight_request),
            self.insight(InsightKind::Tone, &insight_request),
        );
        for (kind, mut reading) in InsightKind::ALL.into_iter().zip([sentiment, context, tone]) {
            result[kind.section()] = reading[kind.section()].take();
        }

        step(progress, 100, "Adding keyword recommendations");
        let mut recommendation = RecommendationRequest::new(
            request.target_keyword.clone(),
            depth.recommendation_limit(),
        );
        recommendation.additional_context = request.additional_context.clone();
        result["recommendations"] = self.recommend_keywords(&recommendation).await;
        result["analysis_depth"] = json!(depth);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AnalysisSettings;
    use crate::models::ProviderRole;
    use crate::tools::llm::testing::{invoker, ScriptedBackend};
    use crate::tools::{BackendError, ProviderInvoker};

    fn absent(kind: ProviderKind, role: ProviderRole) -> ProviderInvoker {
        ProviderInvoker::unconfigured(kind, role, format!("{} is not set", kind.env_key()))
    }

    fn unconfigured() -> Analyzer {
        Analyzer::new(
            absent(ProviderKind::OpenAi, ProviderRole::Primary),
            absent(ProviderKind::Gemini, ProviderRole::Secondary),
            &AnalysisSettings::default(),
        )
    }

    fn with_primary(backend: &Arc<ScriptedBackend>) -> Analyzer {
        Analyzer::new(
            invoker(ProviderRole::Primary, Arc::clone(backend)),
            absent(ProviderKind::Gemini, ProviderRole::Secondary),
            &AnalysisSettings::default(),
        )
    }

    fn insight_request(keyword: &str) -> InsightRequest {
        InsightRequest {
            target_keyword: keyword.to_string(),
            additional_context: None,
        }
    }

    #[tokio::test]
    async fn test_insight_takes_provider_section() {
        let backend = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            r#"```json
{"sentiment": {"overall": "positive", "score": 72},}
```"#,
        ));
        let result = with_primary(&backend)
            .insight(InsightKind::Sentiment, &insight_request("ev"))
            .await;

        assert_eq!(result["sentiment"]["score"], json!(72));
        assert_eq!(result["metadata"]["provider"], json!("openai"));
        assert_eq!(result["metadata"]["model_used"], json!("gpt-4o-mini"));
        assert_eq!(result["metadata"]["is_fallback"], json!(false));
    }

    #[tokio::test]
    async fn test_insight_without_wrapper_uses_whole_object() {
        let backend = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            r#"{"professional": 0.9, "formal": 0.2}"#,
        ));
        let result = with_primary(&backend)
            .insight(InsightKind::Tone, &insight_request("ev"))
            .await;
        assert_eq!(result["tone"]["professional"], json!(0.9));
    }

    #[tokio::test]
    async fn test_insight_without_providers_is_basic() {
        let result = unconfigured()
            .insight(InsightKind::Tone, &insight_request("ev"))
            .await;
        assert_eq!(result["tone"]["professional"], json!(0.5));
        assert_eq!(result["metadata"]["is_fallback"], json!(true));
        assert!(result["metadata"].get("provider").is_none());
    }

    #[tokio::test]
    async fn test_prose_reply_moves_on_to_secondary() {
        let primary = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            "I would rather describe the context in prose.",
        ));
        let secondary = Arc::new(ScriptedBackend::replying(
            ProviderKind::Gemini,
            r#"{"context": {"social_relevance": "high"}}"#,
        ));
        let analyzer = Analyzer::new(
            invoker(ProviderRole::Primary, Arc::clone(&primary)),
            invoker(ProviderRole::Secondary, Arc::clone(&secondary)),
            &AnalysisSettings::default(),
        );

        let result = analyzer
            .insight(InsightKind::Context, &insight_request("ev"))
            .await;
        assert_eq!(result["context"]["social_relevance"], json!("high"));
        assert_eq!(result["metadata"]["provider"], json!("gemini"));
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_recommendations_are_capped() {
        let backend = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            r#"{"related_keywords": {
                "semantic_similar": [{"keyword": "a"}, {"keyword": "b"}, {"keyword": "c"}, {"keyword": "d"}],
                "hierarchical": {"broader": [{"keyword": "x"}, {"keyword": "y"}, {"keyword": "z"}]}
            },
            "recommendation_summary": "charging and price lead"}"#,
        ));
        let mut request = RecommendationRequest::new("ev", 2);
        request.recommendation_type = RecommendationType::All;
        let result = with_primary(&backend).recommend_keywords(&request).await;

        let related = &result["related_keywords"];
        assert_eq!(related["semantic_similar"].as_array().unwrap().len(), 2);
        assert_eq!(related["hierarchical"]["broader"].as_array().unwrap().len(), 2);
        assert_eq!(result["recommendation_summary"], json!("charging and price lead"));
        assert_eq!(result["metadata"]["recommendation_type"], json!("all"));
        assert_eq!(result["metadata"]["max_results"], json!(2));
    }

    #[tokio::test]
    async fn test_recommendations_fall_back_when_provider_fails() {
        let backend = Arc::new(ScriptedBackend::failing(
            ProviderKind::OpenAi,
            BackendError::RateLimited("slow down".into()),
        ));
        let result = with_primary(&backend)
            .recommend_keywords(&RecommendationRequest::new("ev", 1))
            .await;

        let similar = result["related_keywords"]["semantic_similar"].as_array().unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0]["keyword"], json!("ev related 1"));
        assert_eq!(result["metadata"]["is_fallback"], json!(true));
    }

    #[test]
    fn test_recommendation_prompt_names_type_and_limit() {
        let mut request = RecommendationRequest::new("running shoes", 4);
        request.recommendation_type = RecommendationType::CoOccurring;
        request.additional_context = Some("Spring campaign".to_string());

        let prompt = recommendation_prompt(&request, 500);
        assert!(prompt.contains("Keyword: running shoes"));
        assert!(prompt.contains("Recommendation type: co_occurring"));
        assert!(prompt.contains("Maximum results per list: 4"));
        assert!(prompt.contains("\"frequency\""));
        assert!(prompt.contains("Spring campaign"));
    }

    const ANALYSIS_WITH_SENTIMENT: &str =
        r#"{"executive_summary": "Demand is rising.", "sentiment": {"overall": "positive"}}"#;

    #[tokio::test]
    async fn test_compare_reports_each_keyword() {
        let backend = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            ANALYSIS_WITH_SENTIMENT,
        ));
        let request = CompareRequest {
            keywords: vec!["ev".to_string(), "hybrid".to_string()],
            comparison_aspects: Vec::new(),
            use_secondary_provider: false,
        };
        let result = with_primary(&backend).compare(&request).await.unwrap();

        assert_eq!(result["keywords"], json!(["ev", "hybrid"]));
        assert_eq!(result["summary"], json!("2 keywords compared"));
        for keyword in ["ev", "hybrid"] {
            let entry = &result["comparison_results"][keyword];
            assert_eq!(entry["target_keyword"], json!(keyword));
            assert_eq!(entry["executive_summary"], json!("Demand is rising."));
            assert_eq!(entry["sentiment"]["overall"], json!("positive"));
        }
        // One analysis and one sentiment call per keyword.
        assert_eq!(backend.call_count(), 4);
    }

    #[tokio::test]
    async fn test_compare_skips_sentiment_when_not_asked() {
        let backend = Arc::new(ScriptedBackend::replying(
            ProviderKind::OpenAi,
            ANALYSIS_WITH_SENTIMENT,
        ));
        let request = CompareRequest {
            keywords: vec!["ev".to_string(), "hybrid".to_string()],
            comparison_aspects: vec!["market".to_string()],
            use_secondary_provider: false,
        };
        let result = with_primary(&backend).compare(&request).await.unwrap();
        assert!(result["comparison_results"]["ev"].get("sentiment").is_none());
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_compare_surfaces_rejected_sole_credential() {
        let backend = Arc::new(ScriptedBackend::failing(
            ProviderKind::OpenAi,
            BackendError::Unauthorized("invalid api key".into()),
        ));
        let request = CompareRequest {
            keywords: vec!["ev".to_string(), "hybrid".to_string()],
            comparison_aspects: Vec::new(),
            use_secondary_provider: false,
        };
        let err = with_primary(&backend).compare(&request).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_comprehensive_attaches_every_section() {
        let request = AnalysisRequest::new("ev", TargetType::Comprehensive);
        let tracker = ProgressTracker::new();
        let result = unconfigured()
            .comprehensive(&request, AnalysisDepth::Deep, Some(&tracker))
            .await
            .unwrap();

        assert_eq!(result["target_keyword"], json!("ev"));
        assert_eq!(result["metadata"]["degradation"], json!("basic_fallback"));
        assert_eq!(result["sentiment"]["overall"], json!("neutral"));
        assert_eq!(result["context"]["social_relevance"], json!("medium"));
        assert_eq!(result["tone"]["formal"], json!(0.5));
        assert_eq!(result["recommendations"]["metadata"]["max_results"], json!(15));
        assert_eq!(result["analysis_depth"], json!("deep"));
        assert_eq!(tracker.percent(), 100);
    }
}
