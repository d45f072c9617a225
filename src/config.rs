//! Service configuration.
//!
//! Settings come from an optional TOML file (`TARGET_ANALYZER_CONFIG`,
//! default `target-analyzer.toml`) with environment variables layered on
//! top. A missing or unreadable file is not fatal; the defaults apply.
//!
//! API keys are never stored in [`Settings`] after resolution. They are
//! wrapped in [`ApiKey`], whose `Debug` and `Display` only show a masked form.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::ProviderKind;

pub const CONFIG_PATH_ENV: &str = "TARGET_ANALYZER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "target-analyzer.toml";

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

const MIN_KEY_LENGTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-provider section. Every field is optional so a partial section in
/// the file does not reset the others.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub fallback_models: Option<Vec<String>>,
    pub base_url: Option<String>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_deref().map(mask_api_key))
            .field("model", &self.model)
            .field("fallback_models", &self.fallback_models)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub temperature: f64,
    pub request_timeout_secs: u64,
    pub max_context_chars: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            request_timeout_secs: 60,
            max_context_chars: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// Expired entries are swept every this many inserts.
    pub cleanup_interval: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            max_entries: 500,
            cleanup_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub openai: ProviderSettings,
    pub gemini: ProviderSettings,
    pub analysis: AnalysisSettings,
    pub cache: CacheSettings,
}

impl Settings {
    /// File named by `TARGET_ANALYZER_CONFIG` (if any), then the process
    /// environment.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut settings = Self::from_file(&path);
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    pub fn from_file(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(settings) => {
                    info!("loaded settings from {}", path.display());
                    return settings;
                }
                Err(e) => warn!(
                    "failed to parse settings from {}: {}. Using defaults.",
                    path.display(),
                    e
                ),
            },
            Err(e) => warn!(
                "failed to read settings from {}: {}. Using defaults.",
                path.display(),
                e
            ),
        }
        Self::default()
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment overrides through `lookup` so tests can inject a
    /// fake environment. Unparseable numbers are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(model) = get("OPENAI_MODEL") {
            self.openai.model = Some(model);
        }
        if let Some(model) = get("GEMINI_MODEL") {
            self.gemini.model = Some(model);
        }
        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = parsed(get("PORT"), "PORT") {
            self.server.port = port;
        }
        if let Some(ttl) = parsed(get("CACHE_TTL"), "CACHE_TTL") {
            self.cache.ttl_secs = ttl;
        }
        if let Some(enabled) = parsed(get("CACHE_ENABLED"), "CACHE_ENABLED") {
            self.cache.enabled = enabled;
        }
        if let Some(timeout) = parsed(get("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS") {
            self.analysis.request_timeout_secs = timeout;
        }
    }

    pub fn provider(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Gemini => &self.gemini,
        }
    }

    pub fn model(&self, kind: ProviderKind) -> String {
        self.provider(kind)
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model(kind).to_string())
    }

    /// Ordered, de-duplicated model candidates: the configured model first.
    pub fn model_candidates(&self, kind: ProviderKind) -> Vec<String> {
        let fallbacks = self
            .provider(kind)
            .fallback_models
            .clone()
            .unwrap_or_else(|| default_fallbacks(kind));
        let mut candidates = vec![self.model(kind)];
        for model in fallbacks {
            let model = model.trim().to_string();
            if !model.is_empty() && !candidates.contains(&model) {
                candidates.push(model);
            }
        }
        candidates
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>, key: &str) -> Option<T> {
    let raw = value?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

pub fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => DEFAULT_OPENAI_MODEL,
        ProviderKind::Gemini => DEFAULT_GEMINI_MODEL,
    }
}

fn default_fallbacks(kind: ProviderKind) -> Vec<String> {
    let models: &[&str] = match kind {
        ProviderKind::OpenAi => &["gpt-4o-mini", "gpt-4o"],
        ProviderKind::Gemini => &["gemini-2.0-flash", "gemini-1.5-flash"],
    };
    models.iter().map(|m| m.to_string()).collect()
}

/// A validated credential. Only [`ApiKey::expose`] yields the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", mask_api_key(&self.0))
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask_api_key(&self.0))
    }
}

pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Check the shape of a key. Returns the reason it was rejected.
pub fn validate_api_key(kind: ProviderKind, raw: &str) -> Result<ApiKey, String> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(format!("{} is not set", kind.env_key()));
    }
    if kind == ProviderKind::OpenAi && !key.starts_with("sk-") {
        return Err(format!("{} must start with \"sk-\"", kind.env_key()));
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(format!(
            "{} is too short ({} characters, need at least {})",
            kind.env_key(),
            key.len(),
            MIN_KEY_LENGTH
        ));
    }
    Ok(ApiKey(key.to_string()))
}

/// Resolve the credential for `kind`. The environment wins over the file.
pub fn resolve_api_key(
    kind: ProviderKind,
    settings: &Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ApiKey, String> {
    let raw = lookup(kind.env_key())
        .filter(|v| !v.trim().is_empty())
        .or_else(|| settings.provider(kind).api_key.clone())
        .unwrap_or_default();
    let resolved = validate_api_key(kind, &raw);
    match &resolved {
        Ok(key) => info!(
            provider = %kind,
            key = %key,
            key_len = key.len(),
            "credential resolved"
        ),
        Err(reason) => warn!(provider = %kind, "credential unavailable: {}", reason),
    }
    resolved
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyStatus {
    pub openai_configured: bool,
    pub gemini_configured: bool,
    pub message: String,
}

impl ApiKeyStatus {
    pub fn new(openai_configured: bool, gemini_configured: bool) -> Self {
        let message = match (openai_configured, gemini_configured) {
            (true, true) => "OpenAI and Gemini credentials are configured.".to_string(),
            (true, false) => format!(
                "OpenAI is configured; set {} to enable Gemini.",
                ProviderKind::Gemini.env_key()
            ),
            (false, true) => format!(
                "Gemini is configured; set {} to enable OpenAI.",
                ProviderKind::OpenAi.env_key()
            ),
            (false, false) => format!(
                "No provider credentials are configured. Set {} or {}.",
                ProviderKind::OpenAi.env_key(),
                ProviderKind::Gemini.env_key()
            ),
        };
        Self {
            openai_configured,
            gemini_configured,
            message,
        }
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::OpenAi => self.openai_configured,
            ProviderKind::Gemini => self.gemini_configured,
        }
    }

    pub fn any_configured(&self) -> bool {
        self.openai_configured || self.gemini_configured
    }
}
