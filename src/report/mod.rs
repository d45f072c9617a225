//! Typed analysis reports.
//!
//! Whatever shape a provider returned, [`normalize`] turns it into one of
//! the [`StructuredReport`] variants. Every variant carries the same three
//! top-level fields (`target_keyword`, `target_type`, `executive_summary`)
//! plus a [`ReportMetadata`] block describing how the report was produced.

mod normalize;

pub use normalize::{normalize, normalize_for, EMPTY_SUMMARY};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::ApiKeyStatus;
use crate::models::{ProviderKind, TargetType};
use crate::parsing::RepairStage;

pub type JsonMap = Map<String, Value>;

/// How far the pipeline had to degrade to produce a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// Primary and secondary results were combined.
    Merged,
    PrimaryOnly,
    /// The primary failed and the secondary answered.
    Failover,
    /// Only the secondary provider was configured.
    SecondaryOnly,
    /// No provider produced a result.
    BasicFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetadata {
    pub analysis_type: String,
    pub providers: Vec<ProviderKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
    pub models_used: Vec<String>,
    pub is_partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_stage: Option<RepairStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_status: Option<ApiKeyStatus>,
    pub generated_at: DateTime<Utc>,
    /// Diagnostics carried over from recovery (`parse_error`,
    /// `raw_response_preview`) and other free-form flags.
    #[serde(flatten)]
    pub flags: JsonMap,
}

impl ReportMetadata {
    pub fn new(analysis_type: impl Into<String>) -> Self {
        Self {
            analysis_type: analysis_type.into(),
            providers: Vec::new(),
            degradation: None,
            models_used: Vec::new(),
            is_partial: false,
            parse_stage: None,
            merge_error: None,
            api_key_status: None,
            generated_at: Utc::now(),
            flags: JsonMap::new(),
        }
    }

    pub fn record_provider(&mut self, provider: ProviderKind, model: &str) {
        if !self.providers.contains(&provider) {
            self.providers.push(provider);
        }
        if !self.models_used.iter().any(|m| m == model) {
            self.models_used.push(model.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordAnalysis {
    pub trend_analysis: JsonMap,
    pub related_keywords: JsonMap,
    pub sentiment_analysis: JsonMap,
    pub competition_analysis: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordStrategy {
    pub immediate_actions: Vec<Value>,
    pub channel_operations: JsonMap,
    pub content_strategy: JsonMap,
    pub kpi_measurement: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordReport {
    pub target_keyword: String,
    pub target_type: TargetType,
    pub executive_summary: String,
    pub analysis_overview: JsonMap,
    pub key_findings: JsonMap,
    pub detailed_analysis: KeywordAnalysis,
    pub strategic_recommendations: KeywordStrategy,
    pub execution_roadmap: JsonMap,
    pub risk_response: JsonMap,
    pub appendix: JsonMap,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudienceAnalysis {
    pub segmentation: JsonMap,
    pub customer_journey: JsonMap,
    pub personas: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudienceStrategy {
    pub immediate_actions: Vec<Value>,
    pub channel_strategy: JsonMap,
    pub content_strategy: JsonMap,
    pub kpi_framework: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudienceReport {
    pub target_keyword: String,
    pub target_type: TargetType,
    pub executive_summary: String,
    pub analysis_overview: JsonMap,
    pub key_insights: Vec<Value>,
    pub key_findings: JsonMap,
    pub detailed_analysis: AudienceAnalysis,
    pub strategic_recommendations: AudienceStrategy,
    pub execution_roadmap: JsonMap,
    pub risk_governance: JsonMap,
    pub appendix: JsonMap,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComprehensiveFindings {
    pub integrated_insights: Vec<Value>,
    pub quantitative_metrics: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComprehensiveAnalysis {
    pub keyword_audience_alignment: JsonMap,
    pub keyword_insights: JsonMap,
    pub audience_insights: JsonMap,
    pub trends_and_patterns: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComprehensiveStrategy {
    pub immediate_actions: Vec<Value>,
    pub short_term_goals: Vec<Value>,
    pub long_term_vision: Vec<Value>,
    pub content_strategy: JsonMap,
    pub marketing_strategy: JsonMap,
    pub success_metrics: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComprehensiveReport {
    pub target_keyword: String,
    pub target_type: TargetType,
    pub executive_summary: String,
    pub analysis_overview: JsonMap,
    pub key_findings: ComprehensiveFindings,
    pub detailed_analysis: ComprehensiveAnalysis,
    pub strategic_recommendations: ComprehensiveStrategy,
    pub execution_roadmap: JsonMap,
    pub appendix: JsonMap,
    pub metadata: ReportMetadata,
}

/// Report for an unrecognised analysis type. The untouched input is kept
/// under `raw_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenericReport {
    pub target_keyword: String,
    pub target_type: String,
    pub executive_summary: String,
    pub key_findings: JsonMap,
    pub detailed_analysis: JsonMap,
    pub strategic_recommendations: JsonMap,
    pub raw_data: JsonMap,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StructuredReport {
    Keyword(KeywordReport),
    Audience(AudienceReport),
    Comprehensive(ComprehensiveReport),
    Generic(GenericReport),
}

impl StructuredReport {
    pub fn target_keyword(&self) -> &str {
        match self {
            Self::Keyword(r) => &r.target_keyword,
            Self::Audience(r) => &r.target_keyword,
            Self::Comprehensive(r) => &r.target_keyword,
            Self::Generic(r) => &r.target_keyword,
        }
    }

    pub fn target_type(&self) -> &str {
        match self {
            Self::Keyword(r) => r.target_type.as_str(),
            Self::Audience(r) => r.target_type.as_str(),
            Self::Comprehensive(r) => r.target_type.as_str(),
            Self::Generic(r) => &r.target_type,
        }
    }

    pub fn executive_summary(&self) -> &str {
        match self {
            Self::Keyword(r) => &r.executive_summary,
            Self::Audience(r) => &r.executive_summary,
            Self::Comprehensive(r) => &r.executive_summary,
            Self::Generic(r) => &r.executive_summary,
        }
    }

    pub fn metadata(&self) -> &ReportMetadata {
        match self {
            Self::Keyword(r) => &r.metadata,
            Self::Audience(r) => &r.metadata,
            Self::Comprehensive(r) => &r.metadata,
            Self::Generic(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ReportMetadata {
        match self {
            Self::Keyword(r) => &mut r.metadata,
            Self::Audience(r) => &mut r.metadata,
            Self::Comprehensive(r) => &mut r.metadata,
            Self::Generic(r) => &mut r.metadata,
        }
    }

    /// Fill in the keyword when the provider left it out.
    pub fn backfill_keyword(&mut self, keyword: &str) {
        let slot = match self {
            Self::Keyword(r) => &mut r.target_keyword,
            Self::Audience(r) => &mut r.target_keyword,
            Self::Comprehensive(r) => &mut r.target_keyword,
            Self::Generic(r) => &mut r.target_keyword,
        };
        if slot.trim().is_empty() {
            *slot = keyword.to_string();
        }
    }

    pub fn is_partial(&self) -> bool {
        self.metadata().is_partial
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
