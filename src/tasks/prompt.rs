use crate::models::{AnalysisRequest, TargetType};
use crate::tokens::{optimize_additional_context, optimize_prompt};

pub const SYSTEM_PROMPT: &str = "You are a senior marketing analyst. \
You analyze keywords and audiences for marketing and business planning, \
and you always answer with a single JSON object and nothing else.";

fn task_description(target_type: TargetType) -> &'static str {
    match target_type {
        TargetType::Keyword => {
            "Analyze this keyword: search trends, search volume, competition, \
             related keywords, sentiment, and how to act on it."
        }
        TargetType::Audience => {
            "Analyze this target audience in depth: demographics, psychographics, \
             behavior and media habits, needs and pain points, customer journey, \
             personas, and how to reach them."
        }
        TargetType::Comprehensive => {
            "Produce an integrated analysis of this keyword and the audience behind it: \
             how search demand and audience behavior line up, the main trends, \
             and a forward-looking plan."
        }
    }
}

fn output_schema(target_type: TargetType) -> &'static str {
    match target_type {
        TargetType::Keyword => {
            r#"{
  "target_keyword": "the keyword",
  "executive_summary": "3-5 sentence summary",
  "analysis_overview": {"scope": "...", "period": "..."},
  "key_findings": {
    "primary_insights": ["insight 1", "insight 2"],
    "quantitative_metrics": {"estimated_volume": "...", "competition_level": "low|medium|high", "growth_potential": "low|medium|high"}
  },
  "detailed_analysis": {
    "trend_analysis": {"direction": "...", "seasonality": "..."},
    "related_keywords_clusters": {"cluster name": ["keyword", "keyword"]},
    "sentiment_analysis": {"overall": "...", "drivers": ["..."]},
    "competition_alternative_keywords": {"competitors": ["..."], "alternatives": ["..."]}
  },
  "strategic_implications": {
    "immediate_actions": ["action 1", "action 2"],
    "channel_operations": {"channel": "how to use it"},
    "content_strategy": {"themes": ["..."]},
    "kpi_measurement": {"kpi": "target"}
  },
  "execution_roadmap": {"phase_1": "...", "phase_2": "..."},
  "risk_response": {"risk": "mitigation"}
}"#
        }
        TargetType::Audience => {
            r#"{
  "target_keyword": "the audience",
  "executive_summary": "3-5 sentence summary covering demographics, psychographics and behavior",
  "analysis_overview": {"scope": "...", "period": "..."},
  "key_insights": ["insight 1", "insight 2"],
  "detailed_audience_analysis": {
    "segmentation": {"demographics": {"age_range": "...", "gender": "...", "location": "...", "income_level": "...", "expected_occupations": ["..."]}, "psychographics": {"lifestyle": "...", "values": "..."}},
    "customer_journey_decision": {"awareness": "...", "consideration": "...", "purchase": "..."},
    "personas": [{"name": "...", "description": "..."}]
  },
  "strategic_recommendations": {
    "immediate_actions": ["action 1", "action 2"],
    "persona_based_channel_strategy": {"persona": "channel plan"},
    "content_strategy": {"themes": ["..."]},
    "kpi_measurement_framework": {"kpi": "target"}
  },
  "execution_roadmap": {"phase_1": "...", "phase_2": "..."},
  "risk_governance": {"risk": "mitigation"}
}"#
        }
        TargetType::Comprehensive => {
            r#"{
  "target_keyword": "the keyword",
  "executive_summary": "3-5 sentence summary",
  "analysis_overview": {"scope": "...", "period": "..."},
  "key_findings": {
    "integrated_insights": ["insight 1", "insight 2"],
    "quantitative_metrics": {"estimated_volume": "...", "audience_size": "...", "growth_potential": "low|medium|high"}
  },
  "integrated_analysis": {
    "keyword_audience_alignment": {"fit": "...", "gaps": ["..."]},
    "core_keyword_insights": {"trend": "...", "competition": "..."},
    "core_audience_insights": {"segments": ["..."], "needs": ["..."]},
    "trends_and_patterns": {"pattern": "..."}
  },
  "forward_looking_recommendations": {
    "immediate_actions": ["action 1", "action 2"],
    "short_term_goals": ["goal"],
    "long_term_vision": ["vision"],
    "content_strategy": {"themes": ["..."]},
    "marketing_strategy": {"channels": ["..."]},
    "success_metrics": {"kpi": "target"}
  },
  "execution_roadmap": {"phase_1": "...", "phase_2": "..."}
}"#
        }
    }
}

fn period_line(request: &AnalysisRequest) -> Option<String> {
    match (request.start_date, request.end_date) {
        (Some(start), Some(end)) => Some(format!("Analysis period: {start} to {end}")),
        (Some(start), None) => Some(format!("Analysis period: from {start}")),
        (None, Some(end)) => Some(format!("Analysis period: up to {end}")),
        (None, None) => None,
    }
}

/// User prompt for `request`, with the additional context trimmed to
/// `max_context_chars` and whitespace collapsed.
pub fn build_prompt(request: &AnalysisRequest, max_context_chars: usize) -> String {
    let mut prompt = format!(
        "{}\n\nTarget: {}\nAnalysis type: {}\n",
        task_description(request.target_type),
        request.target_keyword,
        request.target_type
    );
    if let Some(period) = period_line(request) {
        prompt.push_str(&period);
        prompt.push('\n');
    }
    if let Some(context) =
        optimize_additional_context(request.additional_context.as_deref(), max_context_chars)
    {
        prompt.push_str(&format!("\nAdditional context:\n{context}\n"));
    }
    prompt.push_str(&format!(
        r#"
Respond with a single JSON object in exactly this shape. Keep every key, fill
every value with real analysis, and do not wrap the JSON in markdown fences:
{}
"#,
        output_schema(request.target_type)
    ));
    optimize_prompt(&prompt, None)
}
