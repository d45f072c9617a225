use serde_json::Value;
use tracing::{debug, warn};

use super::{
    AudienceAnalysis, AudienceReport, AudienceStrategy, ComprehensiveAnalysis,
    ComprehensiveFindings, ComprehensiveReport, ComprehensiveStrategy, GenericReport, JsonMap,
    KeywordAnalysis, KeywordReport, KeywordStrategy, ReportMetadata, StructuredReport,
};
use crate::models::TargetType;

/// Placeholder used when no summary could be found in the input.
pub const EMPTY_SUMMARY: &str = "No executive summary was provided for this analysis.";

/// Keys the recovery layer adds that belong in metadata, not in the body.
const DIAGNOSTIC_KEYS: [(&str, &str); 2] = [
    ("error", "parse_error"),
    ("raw_response_preview", "raw_response_preview"),
];

/// Normalize by type name. Unknown types produce a [`GenericReport`].
pub fn normalize(raw: JsonMap, target_type: &str) -> StructuredReport {
    match target_type.parse::<TargetType>() {
        Ok(kind) => normalize_for(raw, kind),
        Err(_) => {
            warn!(target_type, "unknown analysis type, keeping raw data");
            StructuredReport::Generic(generic(raw, target_type))
        }
    }
}

pub fn normalize_for(raw: JsonMap, target_type: TargetType) -> StructuredReport {
    debug!(%target_type, keys = raw.len(), "normalizing report");
    match target_type {
        TargetType::Keyword => StructuredReport::Keyword(keyword(&raw)),
        TargetType::Audience => StructuredReport::Audience(audience(&raw)),
        TargetType::Comprehensive => StructuredReport::Comprehensive(comprehensive(&raw)),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// First of `keys` holding a non-blank value.
fn first<'a>(raw: &'a JsonMap, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| !is_blank(value))
}

fn object(value: Option<&Value>) -> JsonMap {
    match value {
        Some(Value::Object(map)) => map.clone(),
        Some(other) if !is_blank(other) => {
            let mut wrapped = JsonMap::new();
            wrapped.insert("content".to_string(), other.clone());
            wrapped
        }
        _ => JsonMap::new(),
    }
}

fn object_at(raw: &JsonMap, keys: &[&str]) -> JsonMap {
    object(first(raw, keys))
}

fn list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(other) if !is_blank(other) => vec![other.clone()],
        _ => Vec::new(),
    }
}

fn list_at(raw: &JsonMap, keys: &[&str]) -> Vec<Value> {
    list(first(raw, keys))
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn summary(raw: &JsonMap) -> String {
    text(first(raw, &["executive_summary", "summary", "overview"]))
        .or_else(|| match raw.get("analysis") {
            Some(Value::Object(analysis)) => text(first(analysis, &["summary", "executive_summary"])),
            other => text(other),
        })
        .unwrap_or_else(|| EMPTY_SUMMARY.to_string())
}

fn keyword_text(raw: &JsonMap) -> String {
    text(first(raw, &["target_keyword", "keyword"])).unwrap_or_default()
}

/// Top-level legacy recommendation list, either flat or under `analysis`.
fn legacy_recommendations(raw: &JsonMap) -> Vec<Value> {
    let flat = list_at(raw, &["recommendations"]);
    if !flat.is_empty() {
        return flat;
    }
    match raw.get("analysis") {
        Some(Value::Object(analysis)) => list_at(analysis, &["recommendations"]),
        _ => Vec::new(),
    }
}

fn legacy_points(raw: &JsonMap) -> Vec<Value> {
    list_at(raw, &["key_points", "insights"])
}

fn metadata(raw: &JsonMap, analysis_type: &str) -> ReportMetadata {
    let mut metadata = ReportMetadata::new(analysis_type);
    metadata.is_partial = raw
        .get("is_partial")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    for (source, flag) in DIAGNOSTIC_KEYS {
        if let Some(value) = raw.get(source) {
            metadata.flags.insert(flag.to_string(), value.clone());
        }
    }
    // Flags from a previous normalization survive a second pass.
    if let Some(Value::Object(previous)) = raw.get("metadata") {
        for (key, value) in previous {
            if key.ends_with("_error") || key == "raw_response_preview" {
                metadata.flags.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    metadata
}

fn set_flags<const N: usize>(metadata: &mut ReportMetadata, flags: [(&str, Value); N]) {
    for (key, value) in flags {
        metadata.flags.insert(key.to_string(), value);
    }
}

/// Immediate actions from a strategy block, falling back to legacy lists.
fn immediate_actions(strategy: &JsonMap, raw: &JsonMap) -> Vec<Value> {
    let actions = list_at(strategy, &["immediate_actions", "actions"]);
    if actions.is_empty() {
        legacy_recommendations(raw)
    } else {
        actions
    }
}

fn keyword_findings(raw: &JsonMap) -> JsonMap {
    let mut findings = match first(raw, &["key_findings"]) {
        Some(Value::Array(items)) => {
            let mut map = JsonMap::new();
            map.insert("primary_insights".to_string(), Value::Array(items.clone()));
            map
        }
        other => object(other),
    };
    if !findings.contains_key("primary_insights") {
        let points = legacy_points(raw);
        if !points.is_empty() {
            findings.insert("primary_insights".to_string(), Value::Array(points));
        }
    }
    if !findings.contains_key("quantitative_metrics") {
        if let Some(metrics) = first(raw, &["metrics"]) {
            findings.insert("quantitative_metrics".to_string(), Value::Object(object(Some(metrics))));
        }
    }
    findings
}

fn keyword(raw: &JsonMap) -> KeywordReport {
    let detail = object_at(raw, &["detailed_analysis"]);
    let mut trend_analysis = object_at(&detail, &["trend_analysis", "trends"]);
    if trend_analysis.is_empty() {
        // Old responses put trend data in a top-level `insights` object.
        if let Some(Value::Object(insights)) = raw.get("insights") {
            trend_analysis = insights.clone();
        }
    }
    let strategy = object_at(
        raw,
        &["strategic_implications", "strategic_recommendations"],
    );

    let mut report = KeywordReport {
        target_keyword: keyword_text(raw),
        target_type: TargetType::Keyword,
        executive_summary: summary(raw),
        analysis_overview: object_at(raw, &["analysis_overview"]),
        key_findings: keyword_findings(raw),
        detailed_analysis: KeywordAnalysis {
            trend_analysis,
            related_keywords: object_at(
                &detail,
                &["related_keywords_clusters", "related_keywords"],
            ),
            sentiment_analysis: object_at(&detail, &["sentiment_analysis"]),
            competition_analysis: object_at(
                &detail,
                &["competition_alternative_keywords", "competition_analysis"],
            ),
        },
        strategic_recommendations: KeywordStrategy {
            immediate_actions: immediate_actions(&strategy, raw),
            channel_operations: object_at(&strategy, &["channel_operations", "channel_strategy"]),
            content_strategy: object_at(&strategy, &["content_strategy"]),
            kpi_measurement: object_at(&strategy, &["kpi_measurement", "kpi_framework"]),
        },
        execution_roadmap: object_at(raw, &["execution_roadmap"]),
        risk_response: object_at(raw, &["risk_response", "risk_governance"]),
        appendix: object_at(raw, &["appendix"]),
        metadata: metadata(raw, TargetType::Keyword.as_str()),
    };
    let detail = &report.detailed_analysis;
    let flags = [
        ("has_trend_analysis", Value::Bool(!detail.trend_analysis.is_empty())),
        ("has_related_keywords", Value::Bool(!detail.related_keywords.is_empty())),
        ("has_sentiment_analysis", Value::Bool(!detail.sentiment_analysis.is_empty())),
        ("has_competition_analysis", Value::Bool(!detail.competition_analysis.is_empty())),
        ("action_count", Value::from(report.strategic_recommendations.immediate_actions.len())),
    ];
    set_flags(&mut report.metadata, flags);
    report
}

fn audience(raw: &JsonMap) -> AudienceReport {
    let detail = object_at(raw, &["detailed_audience_analysis", "detailed_analysis"]);
    let strategy = object_at(raw, &["strategic_recommendations", "strategic_implications"]);
    let summary = summary(raw);

    let mut key_insights = list_at(raw, &["key_insights"]);
    if key_insights.is_empty() {
        key_insights = legacy_points(raw);
    }
    let mut key_findings = match first(raw, &["key_findings"]) {
        Some(Value::Array(items)) => {
            if key_insights.is_empty() {
                key_insights = items.clone();
            }
            JsonMap::new()
        }
        other => object(other),
    };
    if key_findings.is_empty() && !key_insights.is_empty() {
        key_findings.insert("insights".to_string(), Value::Array(key_insights.clone()));
    }

    let mut report = AudienceReport {
        target_keyword: keyword_text(raw),
        target_type: TargetType::Audience,
        executive_summary: summary,
        analysis_overview: object_at(raw, &["analysis_overview"]),
        key_insights,
        key_findings,
        detailed_analysis: AudienceAnalysis {
            segmentation: object_at(&detail, &["segmentation", "segments"]),
            customer_journey: object_at(
                &detail,
                &["customer_journey_decision", "customer_journey"],
            ),
            personas: list_at(&detail, &["personas"]),
        },
        strategic_recommendations: AudienceStrategy {
            immediate_actions: immediate_actions(&strategy, raw),
            channel_strategy: object_at(
                &strategy,
                &["persona_based_channel_strategy", "channel_strategy"],
            ),
            content_strategy: object_at(&strategy, &["content_strategy"]),
            kpi_framework: object_at(&strategy, &["kpi_measurement_framework", "kpi_framework"]),
        },
        execution_roadmap: object_at(raw, &["execution_roadmap"]),
        risk_governance: object_at(raw, &["risk_governance", "risk_response"]),
        appendix: object_at(raw, &["appendix"]),
        metadata: metadata(raw, TargetType::Audience.as_str()),
    };
    let detail = &report.detailed_analysis;
    let flags = [
        ("has_segmentation", Value::Bool(!detail.segmentation.is_empty())),
        ("has_customer_journey", Value::Bool(!detail.customer_journey.is_empty())),
        ("persona_count", Value::from(detail.personas.len())),
        ("insight_count", Value::from(report.key_insights.len())),
        ("action_count", Value::from(report.strategic_recommendations.immediate_actions.len())),
    ];
    set_flags(&mut report.metadata, flags);
    report
}

fn comprehensive(raw: &JsonMap) -> ComprehensiveReport {
    let detail = object_at(raw, &["integrated_analysis", "detailed_analysis"]);
    let strategy = object_at(
        raw,
        &["forward_looking_recommendations", "strategic_recommendations"],
    );

    let findings = match first(raw, &["key_findings"]) {
        Some(Value::Array(items)) => {
            let mut map = JsonMap::new();
            map.insert("integrated_insights".to_string(), Value::Array(items.clone()));
            map
        }
        other => object(other),
    };
    let mut integrated_insights = list_at(&findings, &["integrated_insights", "primary_insights"]);
    if integrated_insights.is_empty() {
        integrated_insights = legacy_points(raw);
    }
    let mut quantitative_metrics = object_at(&findings, &["quantitative_metrics"]);
    if quantitative_metrics.is_empty() {
        quantitative_metrics = object_at(raw, &["metrics"]);
    }

    let mut report = ComprehensiveReport {
        target_keyword: keyword_text(raw),
        target_type: TargetType::Comprehensive,
        executive_summary: summary(raw),
        analysis_overview: object_at(raw, &["analysis_overview"]),
        key_findings: ComprehensiveFindings {
            integrated_insights,
            quantitative_metrics,
        },
        detailed_analysis: ComprehensiveAnalysis {
            keyword_audience_alignment: object_at(&detail, &["keyword_audience_alignment"]),
            keyword_insights: object_at(&detail, &["core_keyword_insights", "keyword_insights"]),
            audience_insights: object_at(&detail, &["core_audience_insights", "audience_insights"]),
            trends_and_patterns: object_at(&detail, &["trends_and_patterns", "trend_analysis"]),
        },
        strategic_recommendations: ComprehensiveStrategy {
            immediate_actions: immediate_actions(&strategy, raw),
            short_term_goals: list_at(&strategy, &["short_term_goals"]),
            long_term_vision: list_at(&strategy, &["long_term_vision"]),
            content_strategy: object_at(&strategy, &["content_strategy"]),
            marketing_strategy: object_at(&strategy, &["marketing_strategy"]),
            success_metrics: object_at(&strategy, &["success_metrics", "kpi_measurement"]),
        },
        execution_roadmap: object_at(raw, &["execution_roadmap"]),
        appendix: object_at(raw, &["appendix"]),
        metadata: metadata(raw, TargetType::Comprehensive.as_str()),
    };
    let detail = &report.detailed_analysis;
    let flags = [
        ("has_alignment", Value::Bool(!detail.keyword_audience_alignment.is_empty())),
        ("has_trends", Value::Bool(!detail.trends_and_patterns.is_empty())),
        ("insight_count", Value::from(report.key_findings.integrated_insights.len())),
        ("action_count", Value::from(report.strategic_recommendations.immediate_actions.len())),
    ];
    set_flags(&mut report.metadata, flags);
    report
}

fn generic(raw: JsonMap, target_type: &str) -> GenericReport {
    let mut key_findings = object_at(&raw, &["key_findings"]);
    if key_findings.is_empty() {
        let points = legacy_points(&raw);
        if !points.is_empty() {
            key_findings.insert("primary_insights".to_string(), Value::Array(points));
        }
    }
    GenericReport {
        target_keyword: keyword_text(&raw),
        target_type: target_type.trim().to_string(),
        executive_summary: summary(&raw),
        key_findings,
        detailed_analysis: object_at(&raw, &["detailed_analysis", "analysis"]),
        strategic_recommendations: object_at(&raw, &["strategic_recommendations"]),
        metadata: metadata(&raw, target_type.trim()),
        raw_data: raw,
    }
}
