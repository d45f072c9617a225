use serde_json::Value;
use thiserror::Error;

use crate::models::ProviderKind;
use crate::report::{
    AudienceReport, ComprehensiveReport, GenericReport, JsonMap, KeywordReport, ReportMetadata,
    StructuredReport, EMPTY_SUMMARY,
};

#[derive(Debug, Error)]
#[error("cannot merge a {primary} report with a {secondary} report")]
pub struct MergeMismatch {
    pub primary: String,
    pub secondary: String,
}

trait Merge {
    fn merge_from(&mut self, other: Self);
}

impl Merge for JsonMap {
    fn merge_from(&mut self, other: Self) {
        for (key, incoming) in other {
            match self.get_mut(&key) {
                None => {
                    self.insert(key, incoming);
                }
                Some(Value::Object(existing)) => {
                    if let Value::Object(incoming) = incoming {
                        existing.merge_from(incoming);
                    }
                }
                Some(Value::Array(existing)) => {
                    if let Value::Array(incoming) = incoming {
                        existing.merge_from(incoming);
                    }
                }
                Some(existing) if is_gap(existing) => *existing = incoming,
                Some(_) => {}
            }
        }
    }
}

fn is_gap(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

impl Merge for Vec<Value> {
    fn merge_from(&mut self, other: Self) {
        for item in other {
            if !self.contains(&item) {
                self.push(item);
            }
        }
    }
}

impl Merge for ReportMetadata {
    fn merge_from(&mut self, other: Self) {
        for provider in other.providers {
            if !self.providers.contains(&provider) {
                self.providers.push(provider);
            }
        }
        for model in other.models_used {
            if !self.models_used.contains(&model) {
                self.models_used.push(model);
            }
        }
        if other.is_partial {
            self.flags
                .insert("secondary_partial".to_string(), Value::Bool(true));
        }
        self.is_partial |= other.is_partial;
        self.flags.merge_from(other.flags);
    }
}

fn merge_summary(primary: &mut String, secondary: String, label: &str) {
    let secondary = secondary.trim();
    if secondary.is_empty() || secondary == EMPTY_SUMMARY || secondary == primary.trim() {
        return;
    }
    if primary.trim().is_empty() || primary.as_str() == EMPTY_SUMMARY {
        *primary = secondary.to_string();
        return;
    }
    primary.push_str(&format!("\n\n[{label}] {secondary}"));
}

fn keyword(mut a: KeywordReport, b: KeywordReport, label: &str) -> KeywordReport {
    merge_summary(&mut a.executive_summary, b.executive_summary, label);
    a.analysis_overview.merge_from(b.analysis_overview);
    a.key_findings.merge_from(b.key_findings);

    let (da, db) = (&mut a.detailed_analysis, b.detailed_analysis);
    da.trend_analysis.merge_from(db.trend_analysis);
    da.related_keywords.merge_from(db.related_keywords);
    da.sentiment_analysis.merge_from(db.sentiment_analysis);
    da.competition_analysis.merge_from(db.competition_analysis);

    let (sa, sb) = (&mut a.strategic_recommendations, b.strategic_recommendations);
    sa.immediate_actions.merge_from(sb.immediate_actions);
    sa.channel_operations.merge_from(sb.channel_operations);
    sa.content_strategy.merge_from(sb.content_strategy);
    sa.kpi_measurement.merge_from(sb.kpi_measurement);

    a.execution_roadmap.merge_from(b.execution_roadmap);
    a.risk_response.merge_from(b.risk_response);
    a.appendix.merge_from(b.appendix);
    a.metadata.merge_from(b.metadata);
    a
}

fn audience(mut a: AudienceReport, b: AudienceReport, label: &str) -> AudienceReport {
    merge_summary(&mut a.executive_summary, b.executive_summary, label);
    a.analysis_overview.merge_from(b.analysis_overview);
    a.key_insights.merge_from(b.key_insights);
    a.key_findings.merge_from(b.key_findings);

    let (da, db) = (&mut a.detailed_analysis, b.detailed_analysis);
    da.segmentation.merge_from(db.segmentation);
    da.customer_journey.merge_from(db.customer_journey);
    da.personas.merge_from(db.personas);

    let (sa, sb) = (&mut a.strategic_recommendations, b.strategic_recommendations);
    sa.immediate_actions.merge_from(sb.immediate_actions);
    sa.channel_strategy.merge_from(sb.channel_strategy);
    sa.content_strategy.merge_from(sb.content_strategy);
    sa.kpi_framework.merge_from(sb.kpi_framework);

    a.execution_roadmap.merge_from(b.execution_roadmap);
    a.risk_governance.merge_from(b.risk_governance);
    a.appendix.merge_from(b.appendix);
    a.metadata.merge_from(b.metadata);
    a
}

fn comprehensive(
    mut a: ComprehensiveReport,
    b: ComprehensiveReport,
    label: &str,
) -> ComprehensiveReport {
    merge_summary(&mut a.executive_summary, b.executive_summary, label);
    a.analysis_overview.merge_from(b.analysis_overview);
    a.key_findings
        .integrated_insights
        .merge_from(b.key_findings.integrated_insights);
    a.key_findings
        .quantitative_metrics
        .merge_from(b.key_findings.quantitative_metrics);

    let (da, db) = (&mut a.detailed_analysis, b.detailed_analysis);
    da.keyword_audience_alignment.merge_from(db.keyword_audience_alignment);
    da.keyword_insights.merge_from(db.keyword_insights);
    da.audience_insights.merge_from(db.audience_insights);
    da.trends_and_patterns.merge_from(db.trends_and_patterns);

    let (sa, sb) = (&mut a.strategic_recommendations, b.strategic_recommendations);
    sa.immediate_actions.merge_from(sb.immediate_actions);
    sa.short_term_goals.merge_from(sb.short_term_goals);
    sa.long_term_vision.merge_from(sb.long_term_vision);
    sa.content_strategy.merge_from(sb.content_strategy);
    sa.marketing_strategy.merge_from(sb.marketing_strategy);
    sa.success_metrics.merge_from(sb.success_metrics);

    a.execution_roadmap.merge_from(b.execution_roadmap);
    a.appendix.merge_from(b.appendix);
    a.metadata.merge_from(b.metadata);
    a
}

fn generic(mut a: GenericReport, b: GenericReport, label: &str) -> GenericReport {
    merge_summary(&mut a.executive_summary, b.executive_summary, label);
    a.key_findings.merge_from(b.key_findings);
    a.detailed_analysis.merge_from(b.detailed_analysis);
    a.strategic_recommendations.merge_from(b.strategic_recommendations);
    a.raw_data.merge_from(b.raw_data);
    a.metadata.merge_from(b.metadata);
    a
}

/// Merge `secondary` into `primary`. Reports of different types are
/// rejected and leave nothing changed.
pub fn merge_reports(
    primary: StructuredReport,
    secondary: StructuredReport,
    secondary_provider: ProviderKind,
) -> Result<StructuredReport, (StructuredReport, MergeMismatch)> {
    let label = secondary_provider.label();
    match (primary, secondary) {
        (StructuredReport::Keyword(a), StructuredReport::Keyword(b)) => {
            Ok(StructuredReport::Keyword(keyword(a, b, label)))
        }
        (StructuredReport::Audience(a), StructuredReport::Audience(b)) => {
            Ok(StructuredReport::Audience(audience(a, b, label)))
        }
        (StructuredReport::Comprehensive(a), StructuredReport::Comprehensive(b)) => {
            Ok(StructuredReport::Comprehensive(comprehensive(a, b, label)))
        }
        (StructuredReport::Generic(a), StructuredReport::Generic(b))
            if a.target_type == b.target_type =>
        {
            Ok(StructuredReport::Generic(generic(a, b, label)))
        }
        (primary, secondary) => {
            let mismatch = MergeMismatch {
                primary: primary.target_type().to_string(),
                secondary: secondary.target_type().to_string(),
            };
            Err((primary, mismatch))
        }
    }
}
