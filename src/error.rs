use thiserror::Error;

use crate::models::ProviderKind;

#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// Never retried against the same provider.
    #[error("{provider} is not configured: {message}")]
    Configuration {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} call failed: {message}")]
    ProviderCall {
        provider: ProviderKind,
        message: String,
    },

    #[error("invalid `{field}`: {message}")]
    Validation { field: &'static str, message: String },
}

impl AnalysisError {
    pub fn configuration(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Configuration {
            provider,
            message: message.into(),
        }
    }

    pub fn provider_call(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::ProviderCall {
            provider,
            message: message.into(),
        }
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn error_code(&self) -> String {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR".to_string(),
            Self::ProviderCall { .. } => "PROVIDER_CALL_ERROR".to_string(),
            Self::Validation { field, .. } => {
                format!("VALIDATION_ERROR_{}", field.to_uppercase())
            }
        }
    }
}
