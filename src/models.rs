use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AnalysisError;
use crate::report::StructuredReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Keyword,
    Audience,
    Comprehensive,
}

impl TargetType {
    pub const ALL: [TargetType; 3] = [Self::Keyword, Self::Audience, Self::Comprehensive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Audience => "audience",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "keyword" => Ok(Self::Keyword),
            "audience" => Ok(Self::Audience),
            "comprehensive" => Ok(Self::Comprehensive),
            other => Err(AnalysisError::validation(
                "target_type",
                format!("`{other}` is not one of keyword, audience, comprehensive"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// Human-facing name, used for attribution labels in merged reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Gemini => "Gemini",
        }
    }

    pub fn env_key(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Primary,
    Secondary,
}

/// Request body as it arrives over HTTP, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequestBody {
    pub target_keyword: String,
    #[serde(default = "default_target_type")]
    pub target_type: String,
    #[serde(default)]
    pub additional_context: Option<String>,
    #[serde(default, alias = "use_gemini")]
    pub use_secondary_provider: bool,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

fn default_target_type() -> String {
    TargetType::Keyword.as_str().to_string()
}

impl AnalysisRequestBody {
    pub fn validate(self) -> Result<AnalysisRequest, AnalysisError> {
        let target_keyword = self.target_keyword.trim().to_string();
        if target_keyword.is_empty() {
            return Err(AnalysisError::validation(
                "target_keyword",
                "target_keyword must not be empty",
            ));
        }

        let target_type = self.target_type.parse::<TargetType>()?;
        let start_date = parse_date(self.start_date.as_deref(), "start_date")?;
        let end_date = parse_date(self.end_date.as_deref(), "end_date")?;

        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                return Err(AnalysisError::validation(
                    "start_date",
                    format!("start_date {start} is after end_date {end}"),
                ));
            }
        }

        let additional_context = self
            .additional_context
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        Ok(AnalysisRequest {
            target_keyword,
            target_type,
            additional_context,
            use_secondary_provider: self.use_secondary_provider,
            start_date,
            end_date,
        })
    }
}

fn parse_date(value: Option<&str>, field: &'static str) -> Result<Option<NaiveDate>, AnalysisError> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| {
            AnalysisError::validation(
                field,
                format!("`{raw}` must be a valid date in YYYY-MM-DD form (e.g. 2026-01-28)"),
            )
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub target_keyword: String,
    pub target_type: TargetType,
    pub additional_context: Option<String>,
    pub use_secondary_provider: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl AnalysisRequest {
    pub fn new(target_keyword: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            target_keyword: target_keyword.into(),
            target_type,
            additional_context: None,
            use_secondary_provider: false,
            start_date: None,
            end_date: None,
        }
    }
}

fn required_keyword(raw: &str, field: &'static str) -> Result<String, AnalysisError> {
    let keyword = raw.trim();
    if keyword.is_empty() {
        return Err(AnalysisError::validation(field, format!("{field} must not be empty")));
    }
    Ok(keyword.to_string())
}

fn optional_context(raw: Option<String>) -> Option<String> {
    raw.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
}

/// Body of the sentiment, context and tone endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRequestBody {
    pub target_keyword: String,
    #[serde(default)]
    pub additional_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsightRequest {
    pub target_keyword: String,
    pub additional_context: Option<String>,
}

impl InsightRequestBody {
    pub fn validate(self) -> Result<InsightRequest, AnalysisError> {
        Ok(InsightRequest {
            target_keyword: required_keyword(&self.target_keyword, "target_keyword")?,
            additional_context: optional_context(self.additional_context),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    All,
    Semantic,
    CoOccurring,
    Hierarchical,
    Trending,
    Alternative,
}

impl RecommendationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Semantic => "semantic",
            Self::CoOccurring => "co_occurring",
            Self::Hierarchical => "hierarchical",
            Self::Trending => "trending",
            Self::Alternative => "alternative",
        }
    }
}

impl fmt::Display for RecommendationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendationType {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(Self::All),
            "semantic" => Ok(Self::Semantic),
            "co_occurring" => Ok(Self::CoOccurring),
            "hierarchical" => Ok(Self::Hierarchical),
            "trending" => Ok(Self::Trending),
            "alternative" => Ok(Self::Alternative),
            other => Err(AnalysisError::validation(
                "recommendation_type",
                format!(
                    "`{other}` is not one of all, semantic, co_occurring, hierarchical, trending, alternative"
                ),
            )),
        }
    }
}

pub const MAX_RECOMMENDATIONS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequestBody {
    pub target_keyword: String,
    #[serde(default = "default_recommendation_type")]
    pub recommendation_type: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub additional_context: Option<String>,
}

fn default_recommendation_type() -> String {
    RecommendationType::All.as_str().to_string()
}

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationRequest {
    pub target_keyword: String,
    pub recommendation_type: RecommendationType,
    pub max_results: usize,
    pub additional_context: Option<String>,
}

impl RecommendationRequest {
    pub fn new(target_keyword: impl Into<String>, max_results: usize) -> Self {
        Self {
            target_keyword: target_keyword.into(),
            recommendation_type: RecommendationType::All,
            max_results,
            additional_context: None,
        }
    }
}

impl RecommendationRequestBody {
    pub fn validate(self) -> Result<RecommendationRequest, AnalysisError> {
        if !(1..=MAX_RECOMMENDATIONS).contains(&self.max_results) {
            return Err(AnalysisError::validation(
                "max_results",
                format!("max_results must be between 1 and {MAX_RECOMMENDATIONS}"),
            ));
        }
        Ok(RecommendationRequest {
            target_keyword: required_keyword(&self.target_keyword, "target_keyword")?,
            recommendation_type: self.recommendation_type.parse()?,
            max_results: self.max_results,
            additional_context: optional_context(self.additional_context),
        })
    }
}

pub const MIN_COMPARE_KEYWORDS: usize = 2;
pub const MAX_COMPARE_KEYWORDS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequestBody {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub comparison_aspects: Option<Vec<String>>,
    #[serde(default, alias = "use_gemini")]
    pub use_secondary_provider: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareRequest {
    pub keywords: Vec<String>,
    pub comparison_aspects: Vec<String>,
    pub use_secondary_provider: bool,
}

impl CompareRequest {
    /// Sentiment is included unless the client named aspects without it.
    pub fn includes_sentiment(&self) -> bool {
        self.comparison_aspects.is_empty() || self.comparison_aspects.iter().any(|a| a == "sentiment")
    }
}

impl CompareRequestBody {
    pub fn validate(self) -> Result<CompareRequest, AnalysisError> {
        let mut keywords: Vec<String> = Vec::with_capacity(self.keywords.len());
        for raw in &self.keywords {
            let keyword = required_keyword(raw, "keywords")?;
            if !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
        if keywords.len() < MIN_COMPARE_KEYWORDS {
            return Err(AnalysisError::validation(
                "keywords",
                format!("at least {MIN_COMPARE_KEYWORDS} distinct keywords are needed to compare"),
            ));
        }
        if keywords.len() > MAX_COMPARE_KEYWORDS {
            return Err(AnalysisError::validation(
                "keywords",
                format!("at most {MAX_COMPARE_KEYWORDS} keywords can be compared at once"),
            ));
        }
        let comparison_aspects = self
            .comparison_aspects
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        Ok(CompareRequest {
            keywords,
            comparison_aspects,
            use_secondary_provider: self.use_secondary_provider,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    Basic,
    Standard,
    Deep,
}

impl AnalysisDepth {
    /// Keyword recommendations attached to a comprehensive report.
    pub fn recommendation_limit(&self) -> usize {
        match self {
            Self::Deep => 15,
            Self::Basic | Self::Standard => 10,
        }
    }
}

impl FromStr for AnalysisDepth {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(AnalysisError::validation(
                "analysis_depth",
                format!("`{other}` is not one of basic, standard, deep"),
            )),
        }
    }
}

/// Analysis request plus how much enrichment to attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveRequestBody {
    #[serde(flatten)]
    pub analysis: AnalysisRequestBody,
    #[serde(default = "default_depth")]
    pub analysis_depth: String,
}

fn default_depth() -> String {
    "standard".to_string()
}

impl ComprehensiveRequestBody {
    pub fn validate(self) -> Result<(AnalysisRequest, AnalysisDepth), AnalysisError> {
        let depth = self.analysis_depth.parse()?;
        Ok((self.analysis.validate()?, depth))
    }
}

#[derive(Debug, Clone)]
pub struct RawProviderResponse {
    pub text: String,
    pub provider: ProviderKind,
    pub role: ProviderRole,
    pub model_used: String,
}

/// One line of the NDJSON streaming response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Sentence { content: String, section: String },
    Progress { progress: u8, message: String },
    Complete { data: Box<StructuredReport> },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"type": "error", "message": format!("serialization failed: {e}")})
                .to_string()
        });
        line.push('\n');
        line
    }
}
